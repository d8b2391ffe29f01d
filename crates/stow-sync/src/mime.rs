use std::path::Path;

/// MIME type guessed from the file extension, `application/octet-stream`
/// when unknown.
pub fn mime_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}
