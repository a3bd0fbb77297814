//! Folder-listing entries: what one level of the emulated tree looks like.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A folder synthesized from a common prefix or an explicit marker.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct FolderEntry {
    /// Display name (last path segment).
    pub name: String,
    /// Full object-key prefix, trailing slash included.
    pub key: String,
}

/// A file directly under the listed folder.
#[derive(Serialize, Clone, Debug)]
pub struct FileEntry {
    /// Display name (last path segment).
    pub name: String,
    /// Full object key.
    pub key: String,
    /// Raw size in bytes.
    pub size_bytes: i64,
    /// Human-readable size, e.g. "1.5 MB".
    pub size: String,
    pub last_modified: DateTime<Utc>,
}

/// One level of the tree: subfolders plus direct files.
#[derive(Serialize, Debug, Default)]
pub struct FolderListing {
    pub folders: Vec<FolderEntry>,
    pub files: Vec<FileEntry>,
}

/// Render a byte count the way the UI expects: two decimals, 1024 steps.
pub fn format_size(bytes: i64) -> String {
    const UNITS: [&str; 5] = ["Bytes", "KB", "MB", "GB", "TB"];
    if bytes <= 0 {
        return "0 Bytes".to_string();
    }
    let exponent = (((bytes as f64).ln() / 1024f64.ln()) as usize).min(UNITS.len() - 1);
    let value = bytes as f64 / 1024f64.powi(exponent as i32);
    let rounded = (value * 100.0).round() / 100.0;
    // Trim trailing zeros so 2.00 renders as "2".
    let mut text = format!("{rounded:.2}");
    while text.ends_with('0') {
        text.pop();
    }
    if text.ends_with('.') {
        text.pop();
    }
    format!("{} {}", text, UNITS[exponent])
}

#[cfg(test)]
mod tests {
    use super::format_size;

    #[test]
    fn formats_byte_counts() {
        assert_eq!(format_size(0), "0 Bytes");
        assert_eq!(format_size(512), "512 Bytes");
        assert_eq!(format_size(1024), "1 KB");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(10 * 1024 * 1024), "10 MB");
    }
}
