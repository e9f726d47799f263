//! Shareable-file catalog.
//!
//! The server scans its shared directory into a list of [`FileDescriptor`]s
//! and sends it as text, one file per line:
//!
//! ```text
//! name size_human unit size_bytes checksum
//! 5MB.zip 5 MB 5242880 9f2c...
//! ```
//!
//! The human-readable size is informational; clients rely on `size_bytes`.

use crate::FileDescriptor;
use crate::hasher::file_checksum;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Suffix of in-flight download files, never advertised.
pub const PARTIAL_SUFFIX: &str = ".part";

/// Errors from parsing a catalog listing
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    /// A line does not have the five expected fields
    #[error("Malformed catalog line {line}: {content:?}")]
    MalformedLine {
        /// 1-based line number
        line: usize,
        /// Offending line
        content: String,
    },

    /// The byte size field is not an integer
    #[error("Invalid size on catalog line {line}: {value:?}")]
    InvalidSize {
        /// 1-based line number
        line: usize,
        /// Offending field
        value: String,
    },

    /// The checksum field is not hex
    #[error("Invalid checksum on catalog line {line}: {value:?}")]
    InvalidChecksum {
        /// 1-based line number
        line: usize,
        /// Offending field
        value: String,
    },
}

/// Whether a directory entry name can be advertised.
///
/// Names must be a single whitespace-free token on the wire, so names with
/// whitespace are skipped along with hidden files, partial downloads, and
/// explicitly excluded program or control files.
#[must_use]
pub fn is_shareable_name(name: &str, excludes: &[String]) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.ends_with(PARTIAL_SUFFIX)
        && !name.chars().any(char::is_whitespace)
        && !excludes.iter().any(|e| e == name)
}

/// Scan `dir` and describe every shareable regular file, sorted by name.
///
/// Never fails: an unreadable directory yields an empty list and unreadable
/// files are skipped, each with a warning.
pub fn list_files<P: AsRef<Path>>(dir: P, excludes: &[String]) -> Vec<FileDescriptor> {
    let dir = dir.as_ref();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Cannot read shared directory {}: {}", dir.display(), e);
            return Vec::new();
        }
    };

    let mut files = Vec::new();
    for entry in entries.flatten() {
        let Ok(name) = entry.file_name().into_string() else {
            tracing::debug!("Skipping non-UTF-8 file name {:?}", entry.file_name());
            continue;
        };
        if !is_shareable_name(&name, excludes) {
            continue;
        }

        let path = entry.path();
        let metadata = match fs::metadata(&path) {
            Ok(m) if m.is_file() => m,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };

        match file_checksum(&path) {
            Ok(checksum) => files.push(FileDescriptor {
                name,
                size_bytes: metadata.len(),
                checksum,
            }),
            Err(e) => tracing::warn!("Skipping {}: checksum failed: {}", path.display(), e),
        }
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    files
}

const SIZE_UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

/// Format a byte count as `"<integer> <unit>"` using 1024-based units.
///
/// This is the size column of the catalog listing.
#[must_use]
pub fn format_size(size_bytes: u64) -> String {
    let mut size = size_bytes;
    let mut unit = 0;
    while size >= 1024 && unit < SIZE_UNITS.len() - 1 {
        size /= 1024;
        unit += 1;
    }
    format!("{} {}", size, SIZE_UNITS[unit])
}

/// Format a byte count with two decimals, in the units of [`format_size`].
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < SIZE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", SIZE_UNITS[unit])
}

/// Render descriptors as the newline-separated catalog listing.
#[must_use]
pub fn render_catalog(files: &[FileDescriptor]) -> String {
    files
        .iter()
        .map(|f| {
            format!(
                "{} {} {} {}",
                f.name,
                format_size(f.size_bytes),
                f.size_bytes,
                f.checksum
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse a catalog listing. Blank lines are ignored.
///
/// # Errors
///
/// Returns `CatalogError` for the first line that does not have the form
/// `name size_human unit size_bytes checksum`.
pub fn parse_catalog(text: &str) -> Result<Vec<FileDescriptor>, CatalogError> {
    let mut files = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        if raw.trim().is_empty() {
            continue;
        }

        let fields: Vec<&str> = raw.split_whitespace().collect();
        let [name, _human, _unit, size, checksum] = fields.as_slice() else {
            return Err(CatalogError::MalformedLine {
                line,
                content: raw.to_string(),
            });
        };

        let size_bytes = size.parse::<u64>().map_err(|_| CatalogError::InvalidSize {
            line,
            value: (*size).to_string(),
        })?;

        if !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CatalogError::InvalidChecksum {
                line,
                value: (*checksum).to_string(),
            });
        }

        files.push(FileDescriptor {
            name: (*name).to_string(),
            size_bytes,
            checksum: checksum.to_ascii_lowercase(),
        });
    }

    Ok(files)
}

/// Client-side view of a catalog, indexed by file name.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: BTreeMap<String, FileDescriptor>,
}

impl Catalog {
    /// Build a catalog from descriptors; later duplicates replace earlier ones.
    #[must_use]
    pub fn new(files: Vec<FileDescriptor>) -> Self {
        Self {
            entries: files.into_iter().map(|f| (f.name.clone(), f)).collect(),
        }
    }

    /// Look up a file by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FileDescriptor> {
        self.entries.get(name)
    }

    /// Number of files
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the catalog is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate descriptors in name order
    pub fn iter(&self) -> impl Iterator<Item = &FileDescriptor> {
        self.entries.values()
    }
}
