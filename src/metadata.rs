//! File metadata: the immutable record attached to a transfer (spec §3).

use serde::{Deserialize, Serialize};

const FORBIDDEN_NAME_CHARS: &[char] = &[':', ';', '|', '*', '@', '/', '\\'];

/// Default content type when none is supplied, per spec §3.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Maximum size accepted over HTTP (spec §4.3.1, §9). WebSocket transfers
/// are unbounded by the core.
pub const HTTP_MAX_SIZE: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    #[serde(rename = "content_type")]
    pub content_type: String,
}

impl FileMetadata {
    pub fn new(name: impl Into<String>, size: u64, content_type: Option<String>) -> Result<Self, String> {
        let name = sanitize_name(&name.into());
        if name.len() < 2 || name.len() > 255 {
            return Err("File name must be between 2 and 255 characters.".into());
        }
        if size == 0 {
            return Err("File size has to be positive.".into());
        }
        Ok(Self {
            name,
            size,
            content_type: content_type
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
        })
    }

    /// Build metadata from an HTTP PUT's path filename, `Content-Length` and
    /// `Content-Type` headers (spec §4.3.1).
    pub fn from_http(filename: &str, content_length: Option<&str>, content_type: Option<&str>) -> Result<Self, String> {
        let size = parse_size(content_length.unwrap_or("0"))?;
        Self::new(filename, size, content_type.map(str::to_string))
    }

    /// Build metadata from a WebSocket JSON header
    /// `{"file_name", "file_size", "file_type"}` (spec §4.3.2/§6).
    pub fn from_ws_header(header: &WsFileHeader) -> Result<Self, String> {
        Self::new(header.file_name.clone(), header.file_size, Some(header.file_type.clone()))
    }

    pub fn to_ws_header(&self) -> WsFileHeader {
        WsFileHeader {
            file_name: self.name.clone(),
            file_size: self.size,
            file_type: self.content_type.clone(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("FileMetadata always serializes")
    }

    pub fn from_json(data: &str) -> Result<Self, String> {
        serde_json::from_str(data).map_err(|e| e.to_string())
    }

    /// `(name, human_size, human_type)` for the HTML preview/download pages.
    pub fn human_readable(&self) -> (String, String, String) {
        (self.name.clone(), format_size(self.size), self.content_type.clone())
    }
}

/// WebSocket wire header, using the `file_name`/`file_size`/`file_type`
/// field names spec §6 requires on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsFileHeader {
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
}

/// Replace `: ; | * @ / \` with a space, then drop bytes that don't survive
/// a round-trip through an ISO-8859-1-equivalent encoding (spec §3, §9;
/// mirrors the original's `str.encode('latin-1', 'ignore').decode('utf-8',
/// 'ignore')`).
fn sanitize_name(raw: &str) -> String {
    let spaced: String = raw
        .chars()
        .map(|c| if FORBIDDEN_NAME_CHARS.contains(&c) { ' ' } else { c })
        .collect();
    spaced.chars().filter(|c| (*c as u32) <= 0xFF).collect()
}

fn parse_size(raw: &str) -> Result<u64, String> {
    let trimmed = raw.trim().replace(' ', "");
    let size: i64 = trimmed.parse().map_err(|_| format!("Invalid size format: {raw}"))?;
    if size <= 0 {
        return Err("File size has to be positive.".into());
    }
    Ok(size as u64)
}

fn format_size(size: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    if size == 0 {
        return "0 B".into();
    }
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_forbidden_characters() {
        let meta = FileMetadata::new("a:b;c|d*e@f/g\\h", 10, None).unwrap();
        assert_eq!(meta.name, "a b c d e f g h");
    }

    #[test]
    fn drops_bytes_outside_latin1_range() {
        let meta = FileMetadata::new("caf\u{e9}\u{1F600}.png", 10, None).unwrap();
        assert_eq!(meta.name, "caf\u{e9}.png");
    }

    #[test]
    fn rejects_short_or_long_names() {
        assert!(FileMetadata::new("a", 10, None).is_err());
        assert!(FileMetadata::new("a".repeat(256), 10, None).is_err());
    }

    #[test]
    fn rejects_nonpositive_size() {
        assert!(FileMetadata::new("file.bin", 0, None).is_err());
    }

    #[test]
    fn defaults_content_type() {
        let meta = FileMetadata::new("file.bin", 10, None).unwrap();
        assert_eq!(meta.content_type, DEFAULT_CONTENT_TYPE);
    }

    #[test]
    fn parses_http_headers() {
        let meta = FileMetadata::from_http("report.pdf", Some("65536"), Some("application/pdf")).unwrap();
        assert_eq!(meta.size, 65536);
        assert_eq!(meta.content_type, "application/pdf");
    }

    #[test]
    fn rejects_bad_content_length() {
        assert!(FileMetadata::from_http("f.bin", Some("not-a-number"), None).is_err());
        assert!(FileMetadata::from_http("f.bin", Some("-5"), None).is_err());
    }

    #[test]
    fn json_round_trips() {
        let meta = FileMetadata::new("file.bin", 42, Some("text/plain".into())).unwrap();
        let json = meta.to_json();
        let back = FileMetadata::from_json(&json).unwrap();
        assert_eq!(meta, back);
    }

    #[test]
    fn formats_human_readable_size() {
        let meta = FileMetadata::new("file.bin", 1024 * 1024, None).unwrap();
        let (_, size, _) = meta.human_readable();
        assert_eq!(size, "1.0 MiB");
    }
}
