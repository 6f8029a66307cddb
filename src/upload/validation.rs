//! Input validation for upload requests
//!
//! Every check runs before any side effect and fails with
//! [`UploadError::Validation`] naming the offending field.

use super::types::{StartUploadRequest, UploadError};

/// Longest accepted file name, in characters
pub const MAX_FILE_NAME_LEN: usize = 255;

/// Extensions accepted regardless of the declared MIME type
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "txt",
    "zip", "rar", "7z",
];

/// MIME types accepted regardless of the file extension
pub const ALLOWED_MIME_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "text/plain",
    "application/zip",
    "application/x-rar-compressed",
    "application/x-7z-compressed",
];

const RESERVED_DEVICE_NAMES: &[&str] = &["CON", "PRN", "AUX", "NUL"];

/// Punctuation allowed in file names besides letters, digits and whitespace
const SAFE_PUNCTUATION: &str = "._-,;!@#$%&()+=";

/// Bidi override characters used to disguise extensions
const BIDI_OVERRIDES: &[char] = &['\u{202E}', '\u{202B}', '\u{202F}'];

/// Validate a client-supplied file name.
///
/// Rejects:
/// - Empty or whitespace-only names
/// - Path separators (`/`, `\`)
/// - Control characters and bidi overrides
/// - Trailing `.` or space
/// - Windows reserved device names, bare or with an extension
/// - Characters outside letters, digits, whitespace and [`SAFE_PUNCTUATION`]
pub fn validate_file_name(file_name: &str) -> Result<(), UploadError> {
    let reject = |reason: &str| Err(UploadError::validation("fileName", reason));

    if file_name.trim().is_empty() {
        return reject("file name is empty");
    }
    if file_name.chars().count() > MAX_FILE_NAME_LEN {
        return reject("file name is too long");
    }
    if file_name.contains('/') || file_name.contains('\\') {
        return reject("path separators are not allowed");
    }
    if file_name
        .chars()
        .any(|c| c.is_control() || BIDI_OVERRIDES.contains(&c))
    {
        return reject("control characters are not allowed");
    }
    if file_name.ends_with('.') || file_name.ends_with(' ') {
        return reject("file name must not end with a dot or space");
    }
    if is_reserved_device_name(file_name) {
        return reject("reserved device name");
    }
    if !file_name
        .chars()
        .all(|c| c.is_alphanumeric() || c.is_whitespace() || SAFE_PUNCTUATION.contains(c))
    {
        return reject("file name contains unsupported characters");
    }

    Ok(())
}

fn is_reserved_device_name(file_name: &str) -> bool {
    let stem = file_name.split('.').next().unwrap_or(file_name).trim();
    let upper = stem.to_ascii_uppercase();

    if RESERVED_DEVICE_NAMES.contains(&upper.as_str()) {
        return true;
    }

    // COM1-COM9, LPT1-LPT9
    match upper.as_bytes() {
        [a, b, c, d] => {
            let prefix = [*a, *b, *c];
            (&prefix == b"COM" || &prefix == b"LPT") && (b'1'..=b'9').contains(d)
        }
        _ => false,
    }
}

/// Validate the declared file size against the configured ceiling
pub fn validate_file_size(file_size: u64, max_file_size: u64) -> Result<(), UploadError> {
    if file_size == 0 {
        return Err(UploadError::validation("fileSize", "file size must be positive"));
    }
    if file_size > max_file_size {
        return Err(UploadError::validation(
            "fileSize",
            format!("{} bytes exceeds the limit of {} bytes", file_size, max_file_size),
        ));
    }
    Ok(())
}

/// A file type is allowed if either its MIME type or its extension is allow-listed
pub fn validate_file_type(file_name: &str, content_type: &str) -> Result<(), UploadError> {
    let mime = content_type.trim().to_ascii_lowercase();
    if ALLOWED_MIME_TYPES.contains(&mime.as_str()) {
        return Ok(());
    }

    match file_extension(file_name) {
        Some(ext) if ALLOWED_EXTENSIONS.contains(&ext.as_str()) => Ok(()),
        _ => Err(UploadError::validation(
            "contentType",
            format!("file type not allowed: {}", content_type),
        )),
    }
}

/// Lower-cased extension after the last dot; none for dotfiles or a trailing dot
pub fn file_extension(file_name: &str) -> Option<String> {
    let dot = file_name.rfind('.')?;
    if dot == 0 || dot == file_name.len() - 1 {
        return None;
    }
    Some(file_name[dot + 1..].to_ascii_lowercase())
}

/// Chunk indices must fall in `[0, total_chunks)`; only `0` when there are no chunks
pub fn validate_chunk_index(chunk_index: usize, total_chunks: usize) -> Result<(), UploadError> {
    let valid = if total_chunks == 0 {
        chunk_index == 0
    } else {
        chunk_index < total_chunks
    };

    if valid {
        Ok(())
    } else {
        Err(UploadError::validation(
            "chunkIndex",
            format!("{} is outside 0..{}", chunk_index, total_chunks.max(1)),
        ))
    }
}

/// Run all start-request checks in order: name, size, type
pub fn validate_start(request: &StartUploadRequest, max_file_size: u64) -> Result<(), UploadError> {
    validate_file_name(&request.file_name)?;
    validate_file_size(request.file_size, max_file_size)?;
    validate_file_type(&request.file_name, &request.content_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_checks_name_first() {
        let request = StartUploadRequest {
            file_name: "../x.exe".to_string(),
            file_size: 0,
            content_type: "application/x-msdownload".to_string(),
            client_id: None,
        };
        assert_eq!(field_of(validate_start(&request, 10).unwrap_err()), "fileName");
    }

    fn field_of(err: UploadError) -> &'static str {
        match err {
            UploadError::Validation { field, .. } => field,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_accepts_ordinary_names() {
        assert!(validate_file_name("report.pdf").is_ok());
        assert!(validate_file_name("Quarterly Report (final) v2.docx").is_ok());
        assert!(validate_file_name("年度报告.xlsx").is_ok());
    }

    #[test]
    fn test_rejects_empty_name() {
        assert_eq!(field_of(validate_file_name("   ").unwrap_err()), "fileName");
    }

    #[test]
    fn test_rejects_traversal() {
        assert!(validate_file_name("../../etc/passwd").is_err());
        assert!(validate_file_name("..\\boot.ini").is_err());
    }

    #[test]
    fn test_rejects_control_and_bidi_characters() {
        assert!(validate_file_name("evil\u{0007}.txt").is_err());
        assert!(validate_file_name("invoice\u{202E}fdp.exe").is_err());
    }

    #[test]
    fn test_rejects_trailing_dot_or_space() {
        assert!(validate_file_name("notes.").is_err());
        assert!(validate_file_name("notes ").is_err());
    }

    #[test]
    fn test_rejects_reserved_device_names() {
        assert!(validate_file_name("CON").is_err());
        assert!(validate_file_name("nul.txt").is_err());
        assert!(validate_file_name("LPT1").is_err());
        assert!(validate_file_name("com9.pdf").is_err());
        assert!(validate_file_name("COM10.pdf").is_ok());
        assert!(validate_file_name("console.pdf").is_ok());
    }

    #[test]
    fn test_rejects_unsupported_characters() {
        assert!(validate_file_name("a<b>.txt").is_err());
        assert!(validate_file_name("pipe|name.txt").is_err());
    }

    #[test]
    fn test_rejects_overlong_name() {
        let name = format!("{}.txt", "a".repeat(MAX_FILE_NAME_LEN));
        assert!(validate_file_name(&name).is_err());
    }

    #[test]
    fn test_file_size_bounds() {
        assert_eq!(field_of(validate_file_size(0, 10).unwrap_err()), "fileSize");
        assert!(validate_file_size(10, 10).is_ok());
        assert!(validate_file_size(11, 10).is_err());
    }

    #[test]
    fn test_file_type_by_mime_or_extension() {
        assert!(validate_file_type("report.pdf", "application/pdf").is_ok());
        assert!(validate_file_type("blob.bin", "APPLICATION/PDF").is_ok());
        assert!(validate_file_type("photo.JPG", "application/octet-stream").is_ok());
        assert_eq!(
            field_of(validate_file_type("tool.exe", "application/x-msdownload").unwrap_err()),
            "contentType"
        );
    }

    #[test]
    fn test_extension_parsing() {
        assert_eq!(file_extension("a.tar.GZ").as_deref(), Some("gz"));
        assert_eq!(file_extension(".bashrc"), None);
        assert_eq!(file_extension("noext"), None);
    }

    #[test]
    fn test_chunk_index_bounds() {
        assert!(validate_chunk_index(0, 4).is_ok());
        assert!(validate_chunk_index(3, 4).is_ok());
        assert_eq!(field_of(validate_chunk_index(4, 4).unwrap_err()), "chunkIndex");
        assert!(validate_chunk_index(0, 0).is_ok());
        assert!(validate_chunk_index(1, 0).is_err());
    }
}
