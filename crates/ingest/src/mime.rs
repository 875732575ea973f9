//! Media type guessed from the file extension.

use std::path::Path;

const FALLBACK: &str = "application/octet-stream";

/// Map an export file name to the media type sent with its notice.
pub fn mime_for(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "xml" => "application/xml",
        "ems" | "txt" | "text" => "text/plain",
        "awf" | "zip" => "application/zip",
        "csv" => "text/csv",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "md" | "markdown" => "text/markdown",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "tif" | "tiff" => "image/tiff",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => FALLBACK,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_extensions_case_insensitive() {
        assert_eq!(mime_for("claim_001.csv"), "text/csv");
        assert_eq!(mime_for("ESTIMATE.XML"), "application/xml");
        assert_eq!(mime_for("workfile.ems"), "text/plain");
        assert_eq!(mime_for("photos.AWF"), "application/zip");
    }

    #[test]
    fn unknown_or_missing_extension_falls_back() {
        assert_eq!(mime_for("README"), FALLBACK);
        assert_eq!(mime_for("data.bin"), FALLBACK);
    }
}
