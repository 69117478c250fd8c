//! Media collaborators and the two per-artifact stages.
//!
//! | Piece | Role |
//! |---|---|
//! | **Backends** | [`ImageGenerator`] / [`ImageUploader`] traits, command-line implementations |
//! | **Credentials** | one-time advisory check of the image-host token |
//! | **Stages** | [`GenerationStage`] and [`UploadStage`]: retry + error classification |
//!
//! The module is split into:
//! - **Parameters**: what a single generation request asks for
//! - **Backend**: the collaborator traits (mocks live in its test module)
//! - **Command backend**: external processes with a wall-clock deadline
//! - **Operations**: stages combining a backend with the retry policy

pub mod backend;
pub mod command_backend;
pub mod credentials;
pub mod operations;
mod params;

pub use backend::{BackendError, ImageGenerator, ImageUploader};
pub use command_backend::{CommandGenerator, CommandUploader, PreflightItem, preflight};
pub use credentials::{CredentialCheck, CredentialStatus, CredentialValidator, TokenCheck};
pub use operations::{GenerationStage, UploadStage, parse_upload_output};
pub use params::{GenerateParams, PixelSize, Resolution, UnknownResolution};
