//! Content-type detection for stored files.

use std::path::Path;

/// MIME type reported for zip archives.
pub const ZIP_MIME: &str = "application/zip";

/// Number of leading bytes inspected by [`detect_content_type`].
pub const SNIFF_LEN: usize = 512;

/// Detect a MIME type from leading bytes, falling back to the file extension.
pub fn detect_content_type(data: &[u8], filename: Option<&str>) -> String {
    let sample = &data[..data.len().min(SNIFF_LEN)];

    if let Some(mime) = detect_from_magic(sample) {
        return mime.to_string();
    }

    let by_extension = filename.and_then(detect_from_extension);
    if looks_like_text(sample) {
        return match by_extension {
            Some(mime) if is_textual_mime(&mime) => mime,
            _ => "text/plain".to_string(),
        };
    }

    by_extension.unwrap_or_else(|| "application/octet-stream".to_string())
}

/// Whether a file with this MIME type and name may be opened in the text editor.
pub fn is_text_content(mime: &str, filename: &str) -> bool {
    if is_textual_mime(mime) {
        return true;
    }
    let ext = Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase());
    matches!(ext.as_deref(), Some("md") | Some("txt"))
}

fn is_textual_mime(mime: &str) -> bool {
    let essence = mime.split(';').next().unwrap_or_default().trim();
    essence.starts_with("text/")
        || matches!(
            essence,
            "application/json"
                | "application/javascript"
                | "application/xml"
                | "application/x-yaml"
                | "application/yaml"
                | "application/toml"
                | "application/x-sh"
        )
}

fn detect_from_magic(data: &[u8]) -> Option<&'static str> {
    if data.len() < 4 {
        return None;
    }

    // Zip local file header, empty archive, spanned archive
    if data.starts_with(b"PK\x03\x04")
        || data.starts_with(b"PK\x05\x06")
        || data.starts_with(b"PK\x07\x08")
    {
        return Some(ZIP_MIME);
    }
    if data.starts_with(&[0x1F, 0x8B]) {
        return Some("application/gzip");
    }
    if data.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        return Some("image/png");
    }
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    if data.starts_with(b"%PDF") {
        return Some("application/pdf");
    }
    if data.starts_with(b"\x7FELF") {
        return Some("application/x-executable");
    }
    None
}

fn detect_from_extension(filename: &str) -> Option<String> {
    mime_guess::from_path(filename)
        .first()
        .map(|m| m.essence_str().to_string())
}

fn looks_like_text(data: &[u8]) -> bool {
    !data.contains(&0) && std::str::from_utf8(trim_partial_char(data)).is_ok()
}

/// Drop a UTF-8 sequence cut off by the sample boundary.
fn trim_partial_char(data: &[u8]) -> &[u8] {
    match std::str::from_utf8(data) {
        Ok(_) => data,
        Err(e) if e.error_len().is_none() => &data[..e.valid_up_to()],
        Err(_) => data,
    }
}
