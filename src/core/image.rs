//! Image descriptors and compression detection
//!
//! An [`ImageSource`] is the resolved form of whatever the caller asked for:
//! a direct URL, a file found by walking directory listings, or a local path.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::ResolutionError;

/// How an image was located
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// URL pointing straight at an image file
    DirectUrl,
    /// File discovered by walking directory listings
    DirectoryListing,
    /// File already on local storage
    LocalFile,
}

impl SourceKind {
    /// Whether the image must be downloaded before writing
    pub fn is_remote(self) -> bool {
        !matches!(self, Self::LocalFile)
    }
}

/// Image compression format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Raw,
    Xz,
    Gz,
    Zip,
}

impl Compression {
    /// Infer compression from a file name's extension
    pub fn from_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".xz") {
            Self::Xz
        } else if lower.ends_with(".gz") {
            Self::Gz
        } else if lower.ends_with(".zip") {
            Self::Zip
        } else {
            Self::Raw
        }
    }

    /// Infer compression from leading magic bytes
    pub fn from_magic(header: &[u8]) -> Option<Self> {
        if header.starts_with(&[0x1F, 0x8B]) {
            Some(Self::Gz)
        } else if header.starts_with(&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00]) {
            Some(Self::Xz)
        } else if header.starts_with(&[0x50, 0x4B, 0x03, 0x04]) {
            Some(Self::Zip)
        } else {
            None
        }
    }

    /// Detect compression of a local file, by extension first and magic second
    pub fn detect(path: &Path) -> Self {
        let by_name = path
            .file_name()
            .map(|n| Self::from_name(&n.to_string_lossy()))
            .unwrap_or(Self::Raw);
        if by_name != Self::Raw {
            return by_name;
        }

        let mut header = [0u8; 6];
        let read = std::fs::File::open(path)
            .and_then(|mut f| f.read(&mut header))
            .unwrap_or(0);
        Self::from_magic(&header[..read]).unwrap_or(Self::Raw)
    }

    /// Whether the uncompressed length can be known before streaming
    pub fn size_known_upfront(self) -> bool {
        matches!(self, Self::Raw | Self::Zip)
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Raw => "raw",
            Self::Xz => "xz",
            Self::Gz => "gz",
            Self::Zip => "zip",
        };
        f.write_str(name)
    }
}

/// A concrete image ready to fetch or write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSource {
    /// How the image was located
    pub kind: SourceKind,
    /// Resolved URL or local path
    pub location: String,
    /// File name of the image
    pub resolved_filename: String,
    /// Compression format
    pub compression: Compression,
    /// Descriptor originally requested
    pub origin: String,
    /// Listing URLs visited during resolution
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traversal: Vec<String>,
}

impl ImageSource {
    /// Build a source for a direct URL
    pub fn direct(url: &str) -> Self {
        let name = last_segment(url).to_string();
        Self {
            kind: SourceKind::DirectUrl,
            location: url.to_string(),
            compression: Compression::from_name(&name),
            resolved_filename: name,
            origin: url.to_string(),
            traversal: Vec::new(),
        }
    }

    /// Build a source for a file found in a listing
    pub fn from_listing(origin: &str, url: &str, traversal: Vec<String>) -> Self {
        let name = last_segment(url).to_string();
        Self {
            kind: SourceKind::DirectoryListing,
            location: url.to_string(),
            compression: Compression::from_name(&name),
            resolved_filename: name,
            origin: origin.to_string(),
            traversal,
        }
    }

    /// Build a source for a local file, which must exist
    pub fn local(path: &Path) -> Result<Self, ResolutionError> {
        if !path.is_file() {
            return Err(ResolutionError::MissingLocalFile {
                path: path.to_path_buf(),
            });
        }
        Ok(Self {
            kind: SourceKind::LocalFile,
            location: path.display().to_string(),
            resolved_filename: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            compression: Compression::detect(path),
            origin: path.display().to_string(),
            traversal: Vec::new(),
        })
    }

    /// Local path of the image, for local sources
    pub fn local_path(&self) -> Option<PathBuf> {
        (self.kind == SourceKind::LocalFile).then(|| PathBuf::from(&self.location))
    }
}

/// Descriptor classification before any network access
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    Local(PathBuf),
    DirectUrl(String),
    Listing(String),
}

impl Descriptor {
    /// Classify a raw descriptor string
    pub fn parse(raw: &str) -> Result<Self, ResolutionError> {
        let raw = raw.trim();
        if let Some(path) = raw.strip_prefix("file://") {
            return Ok(Self::Local(PathBuf::from(path)));
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return if is_image_name(last_segment(raw)) {
                Ok(Self::DirectUrl(raw.to_string()))
            } else {
                Ok(Self::Listing(raw.to_string()))
            };
        }
        if raw.contains("://") || raw.is_empty() {
            return Err(ResolutionError::InvalidDescriptor {
                descriptor: raw.to_string(),
            });
        }
        Ok(Self::Local(PathBuf::from(raw)))
    }
}

fn image_name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"(?i)^[^/]+\.(?:(?:img|iso|raw)(?:\.(?:xz|gz|zip))?|zip)$").ok()
        })
        .as_ref()
}

/// Whether a file name looks like a flashable image
pub fn is_image_name(name: &str) -> bool {
    image_name_pattern().is_some_and(|re| re.is_match(name))
}

/// Last non-empty path segment of a URL or path, without query or fragment
pub fn last_segment(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}
