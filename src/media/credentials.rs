//! Lazy, advisory validation of image-host credentials.
//!
//! The upload stage owns a [`CredentialValidator`]. The first upload through
//! it runs the configured [`CredentialCheck`] exactly once; the outcome is
//! logged and kept, and never blocks the upload itself.

use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("${0} is not set")]
    MissingToken(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("validation endpoint answered {status}")]
    Rejected { status: u16 },
}

/// Something that can confirm the uploader's credentials.
pub trait CredentialCheck: Send + Sync {
    /// A short confirmation on success.
    fn check(&self) -> Result<String, CredentialError>;
}

/// Outcome of the one-time check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialStatus {
    Valid(String),
    Invalid(String),
    /// No check configured.
    Skipped,
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialStatus::Valid(summary) => write!(f, "ok ({summary})"),
            CredentialStatus::Invalid(reason) => write!(f, "not confirmed: {reason}"),
            CredentialStatus::Skipped => f.write_str("not configured"),
        }
    }
}

/// Runs a [`CredentialCheck`] at most once.
pub struct CredentialValidator {
    check: Option<Box<dyn CredentialCheck>>,
    outcome: OnceLock<CredentialStatus>,
}

impl CredentialValidator {
    pub fn new(check: impl CredentialCheck + 'static) -> Self {
        Self {
            check: Some(Box::new(check)),
            outcome: OnceLock::new(),
        }
    }

    /// A validator that never checks anything.
    pub fn disabled() -> Self {
        Self {
            check: None,
            outcome: OnceLock::new(),
        }
    }

    /// Run the check if it has not run yet.
    ///
    /// Returns the outcome only on the call that performed the check.
    pub fn validate_once(&self) -> Option<&CredentialStatus> {
        let mut ran = false;
        let status = self.outcome.get_or_init(|| {
            ran = true;
            self.run_check()
        });
        ran.then_some(status)
    }

    /// Outcome of the check, if it already ran.
    pub fn status(&self) -> Option<&CredentialStatus> {
        self.outcome.get()
    }

    fn run_check(&self) -> CredentialStatus {
        let Some(check) = &self.check else {
            return CredentialStatus::Skipped;
        };
        match check.check() {
            Ok(summary) => {
                tracing::info!(%summary, "upload credentials confirmed");
                CredentialStatus::Valid(summary)
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not confirm upload credentials; uploading anyway");
                CredentialStatus::Invalid(e.to_string())
            }
        }
    }
}

impl Default for CredentialValidator {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Bearer token from the environment, probed against a validation URL.
#[derive(Debug, Clone)]
pub struct TokenCheck {
    pub token_env: String,
    /// When `None`, only the token's presence is confirmed.
    pub validate_url: Option<String>,
    pub timeout: Duration,
}

impl CredentialCheck for TokenCheck {
    fn check(&self) -> Result<String, CredentialError> {
        let token = std::env::var(&self.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| CredentialError::MissingToken(self.token_env.clone()))?;

        let Some(url) = &self.validate_url else {
            return Ok(format!("${} is set", self.token_env));
        };

        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;
        let response = client.get(url).bearer_auth(token).send()?;
        let status = response.status();
        if status.is_success() {
            Ok(format!("{url} accepted the token"))
        } else {
            Err(CredentialError::Rejected {
                status: status.as_u16(),
            })
        }
    }
}
