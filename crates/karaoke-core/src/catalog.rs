//! Catalog codes and media file naming.
//!
//! Every song is identified by a five-digit code (`"01234"`). Local media
//! files are named `<code>.<ext>` directly under the media root; in-flight
//! downloads use a `.part` suffix and are never treated as media.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Media container extensions the player understands.
pub const MEDIA_EXTENSIONS: &[&str] = &["mp4", "mkv", "webm", "mp3"];

/// Extension used when a media reference carries no usable one.
pub const DEFAULT_EXTENSION: &str = "mp4";

/// Suffix of partially downloaded files.
pub const PART_SUFFIX: &str = ".part";

static MEDIA_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{5})\.(mp4|mkv|webm|mp3)$").expect("static regex is valid")
});

/// A five-digit catalog code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CatalogCode(String);

impl CatalogCode {
    pub fn parse(input: &str) -> Result<Self, Error> {
        let trimmed = input.trim();
        if trimmed.len() == 5 && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(Error::InvalidCode(input.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name for this code's media with the given extension.
    pub fn file_name(&self, ext: &str) -> String {
        format!("{}.{ext}", self.0)
    }
}

impl fmt::Display for CatalogCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CatalogCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CatalogCode {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CatalogCode> for String {
    fn from(code: CatalogCode) -> Self {
        code.0
    }
}

/// Catalog metadata as published by the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Authority change counter; also the paging cursor.
    pub revision: i64,
    pub codigo: CatalogCode,
    pub artista: String,
    pub titulo: String,
    /// Absolute URL, or a path relative to the authority base URL.
    pub media_ref: String,
    /// Size in bytes, when known.
    pub size: Option<i64>,
    /// Duration in seconds, when known.
    pub duration: Option<i64>,
}

impl CatalogEntry {
    /// Local file name for this entry's media.
    pub fn file_name(&self) -> String {
        self.codigo.file_name(media_extension(&self.media_ref))
    }
}

/// Pick the extension for a media reference, falling back to `mp4`.
pub fn media_extension(media_ref: &str) -> &'static str {
    let path = media_ref.split(['?', '#']).next().unwrap_or_default();
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    ext.and_then(|e| MEDIA_EXTENSIONS.iter().find(|known| **known == e).copied())
        .unwrap_or(DEFAULT_EXTENSION)
}

/// Parse a file name found under the media root.
///
/// Returns `None` for anything that is not `<5 digits>.<known ext>`,
/// including `.part` files.
pub fn parse_media_file_name(name: &str) -> Option<CatalogCode> {
    if name.ends_with(PART_SUFFIX) {
        return None;
    }
    MEDIA_FILE
        .captures(name)
        .and_then(|caps| caps.get(1))
        .map(|m| CatalogCode(m.as_str().to_string()))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_five_digits() {
        assert_eq!(CatalogCode::parse("01234").unwrap().as_str(), "01234");
        assert_eq!(CatalogCode::parse(" 01234 ").unwrap().as_str(), "01234");
        assert!(CatalogCode::parse("1234").is_err());
        assert!(CatalogCode::parse("123456").is_err());
        assert!(CatalogCode::parse("12a45").is_err());
        assert!(CatalogCode::parse("１２３４５").is_err());
    }

    #[test]
    fn extension_comes_from_reference() {
        assert_eq!(media_extension("media/01234.mkv"), "mkv");
        assert_eq!(media_extension("https://cdn/x/01234.WEBM?sig=abc"), "webm");
        assert_eq!(media_extension("media/01234"), "mp4");
        assert_eq!(media_extension("media/01234.exe"), "mp4");
    }

    #[test]
    fn media_file_names() {
        assert_eq!(
            parse_media_file_name("01234.mp4").map(String::from),
            Some("01234".to_string())
        );
        assert!(parse_media_file_name("01234.mp4.part").is_none());
        assert!(parse_media_file_name("1234.mp4").is_none());
        assert!(parse_media_file_name("01234.txt").is_none());
        assert!(parse_media_file_name("notes.mp4").is_none());
    }

    #[test]
    fn entry_file_name_uses_reference_extension() {
        let entry = CatalogEntry {
            revision: 1,
            codigo: CatalogCode::parse("00042").unwrap(),
            artista: "Artist".into(),
            titulo: "Song".into(),
            media_ref: "media/00042.mkv".into(),
            size: None,
            duration: None,
        };
        assert_eq!(entry.file_name(), "00042.mkv");
    }
}
