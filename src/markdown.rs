//! Image placeholders in Markdown articles.
//!
//! An article marks where images belong with single-line HTML comments:
//!
//! ```markdown
//! <!-- IMAGE: cover | 16:9 | A lighthouse at dawn, watercolor -->
//! <!-- IMAGE: diagram | Flat illustration of a data pipeline -->
//! ```
//!
//! The aspect ratio is optional (`3:2` when absent). Placeholders are found
//! with `pulldown-cmark`, so comments inside fenced or indented code blocks
//! are left alone. After a batch, each placeholder whose image was uploaded
//! is replaced by `![name](url)`; the rest stay in place so a later run can
//! pick them up.

use pulldown_cmark::{Event, Options, Parser};
use std::collections::HashMap;
use std::ops::Range;
use thiserror::Error;

use crate::artifact::{ArtifactSpec, AspectRatio, UnknownAspectRatio, first_duplicate_filename};
use crate::types::BatchResult;

const OPEN: &str = "<!--";
const CLOSE: &str = "-->";
const TAG: &str = "IMAGE:";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaceholderError {
    #[error("line {line}: malformed image placeholder {text:?}; expected <!-- IMAGE: name | [aspect |] prompt -->")]
    Malformed { line: usize, text: String },
    #[error("line {line}: {source}")]
    AspectRatio {
        line: usize,
        source: UnknownAspectRatio,
    },
    #[error("line {line}: image name {name:?} must not contain path separators")]
    InvalidName { line: usize, name: String },
    #[error("line {line}: image name {name:?} is already used on line {first_line}")]
    DuplicateName {
        line: usize,
        first_line: usize,
        name: String,
    },
    #[error("no <!-- IMAGE: ... --> placeholders found")]
    Empty,
}

/// One image placeholder found in a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub name: String,
    pub aspect_ratio: Option<AspectRatio>,
    pub prompt: String,
    /// Byte range of the whole comment in the source.
    pub range: Range<usize>,
    /// 1-based line number.
    pub line: usize,
}

impl Placeholder {
    pub fn to_spec(&self) -> ArtifactSpec {
        ArtifactSpec {
            name: self.name.clone(),
            prompt: self.prompt.clone(),
            aspect_ratio: self.aspect_ratio.unwrap_or_default(),
            filename: None,
        }
    }
}

/// Find every image placeholder outside code, in document order.
pub fn find_placeholders(text: &str) -> Result<Vec<Placeholder>, PlaceholderError> {
    let mut found = Vec::new();
    for (event, range) in Parser::new_ext(text, Options::empty()).into_offset_iter() {
        if !matches!(event, Event::Html(_) | Event::InlineHtml(_)) {
            continue;
        }
        let chunk = &text[range.clone()];
        let mut cursor = 0;
        while let Some(rel) = chunk[cursor..].find(OPEN) {
            let start = cursor + rel;
            let Some(end_rel) = chunk[start..].find(CLOSE) else {
                break;
            };
            let end = start + end_rel + CLOSE.len();
            let comment = &chunk[start..end];
            cursor = end;

            let body = comment[OPEN.len()..comment.len() - CLOSE.len()].trim();
            let Some(spec) = body.strip_prefix(TAG) else {
                continue;
            };
            let abs = range.start + start..range.start + end;
            let line = line_of(text, abs.start);
            if comment.contains('\n') {
                return Err(PlaceholderError::Malformed {
                    line,
                    text: comment.to_string(),
                });
            }
            found.push(parse_body(spec, abs, line, comment)?);
        }
    }
    found.sort_by_key(|p| p.range.start);
    found.dedup_by_key(|p| p.range.start);
    Ok(found)
}

fn parse_body(
    spec: &str,
    range: Range<usize>,
    line: usize,
    comment: &str,
) -> Result<Placeholder, PlaceholderError> {
    let parts: Vec<&str> = spec.split('|').map(str::trim).collect();
    let malformed = || PlaceholderError::Malformed {
        line,
        text: comment.to_string(),
    };

    let (name, aspect_ratio, prompt) = match parts.as_slice() {
        [name, middle, rest @ ..] if !rest.is_empty() && looks_like_ratio(middle) => {
            let ratio = middle
                .parse::<AspectRatio>()
                .map_err(|source| PlaceholderError::AspectRatio { line, source })?;
            (*name, Some(ratio), rest.join(" | "))
        }
        [name, rest @ ..] if !rest.is_empty() => (*name, None, rest.join(" | ")),
        _ => return Err(malformed()),
    };

    if name.is_empty() || prompt.trim().is_empty() {
        return Err(malformed());
    }
    if name.contains(['/', '\\']) {
        return Err(PlaceholderError::InvalidName {
            line,
            name: name.to_string(),
        });
    }

    Ok(Placeholder {
        name: name.to_string(),
        aspect_ratio,
        prompt: prompt.trim().to_string(),
        range,
        line,
    })
}

fn looks_like_ratio(s: &str) -> bool {
    match s.split_once(':') {
        Some((w, h)) => {
            !w.is_empty()
                && !h.is_empty()
                && w.chars().all(|c| c.is_ascii_digit())
                && h.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

fn line_of(text: &str, offset: usize) -> usize {
    text[..offset].matches('\n').count() + 1
}

/// Artifact specs for a document's placeholders.
pub fn specs_from_placeholders(
    placeholders: &[Placeholder],
) -> Result<Vec<ArtifactSpec>, PlaceholderError> {
    if placeholders.is_empty() {
        return Err(PlaceholderError::Empty);
    }
    let specs: Vec<ArtifactSpec> = placeholders.iter().map(Placeholder::to_spec).collect();
    if let Some((index, first)) = first_duplicate_filename(&specs) {
        return Err(PlaceholderError::DuplicateName {
            line: placeholders[index].line,
            first_line: placeholders[first].line,
            name: placeholders[index].name.clone(),
        });
    }
    Ok(specs)
}

/// Replace each placeholder that has a URL in `urls` (keyed by name).
///
/// Returns the new text and the number of placeholders replaced.
pub fn rewrite_placeholders(
    text: &str,
    placeholders: &[Placeholder],
    urls: &HashMap<String, String>,
) -> (String, usize) {
    let mut out = text.to_string();
    let mut replaced = 0;
    let mut ordered: Vec<&Placeholder> = placeholders.iter().collect();
    ordered.sort_by_key(|p| std::cmp::Reverse(p.range.start));
    for placeholder in ordered {
        if let Some(url) = urls.get(&placeholder.name) {
            out.replace_range(
                placeholder.range.clone(),
                &format!("![{}]({})", placeholder.name, url),
            );
            replaced += 1;
        }
    }
    (out, replaced)
}

/// Name → URL for every uploaded image in `result`.
pub fn uploaded_urls(result: &BatchResult) -> HashMap<String, String> {
    result
        .images
        .iter()
        .filter_map(|img| img.remote_url.clone().map(|url| (img.name.clone(), url)))
        .collect()
}
