//! Content-serving algorithm: entry lookup with namespace
//! fallback, redirect handling, MIME inference, EPUB/PDF special-casing,
//! HTTP range support for streamable media, and `<base>`-tag stripping.
//! Grounded verbatim in `_serve_zim_content` from `zimi/server.py`.

use sha2::{Digest, Sha256};
use zimi_core::reader::{ZimEntry, ZimReader};

pub const MAX_SERVE_BYTES: u64 = 50 * 1024 * 1024;

const NAMESPACE_PREFIXES: &[&str] = &["A/", "I/", "C/", "-/"];

fn mime_from_extension(path: &str) -> Option<&'static str> {
    let ext = path.rsplit('.').next()?.to_lowercase();
    Some(match ext.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "pdf" => "application/pdf",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "ogg" | "oga" => "application/ogg",
        "wav" => "audio/wav",
        "wasm" => "application/wasm",
        "epub" => "application/epub+zip",
        "txt" => "text/plain",
        "xml" => "application/xml",
        _ => return None,
    })
}

fn is_streamable(mime: &str) -> bool {
    mime.starts_with("video/") || mime.starts_with("audio/") || mime == "application/ogg"
}

/// Entry lookup with the `A/`/`I/`/`C/`/`-/` namespace-prefix fallback for
/// archives built under the other layout convention.
pub fn resolve_entry(reader: &dyn ZimReader, entry_path: &str) -> Option<ZimEntry> {
    if let Some(entry) = reader.get_entry_by_path(entry_path) {
        return Some(entry);
    }
    for prefix in NAMESPACE_PREFIXES {
        if let Some(stripped) = entry_path.strip_prefix(prefix) {
            if let Some(entry) = reader.get_entry_by_path(stripped) {
                return Some(entry);
            }
        } else {
            let prefixed = format!("{prefix}{entry_path}");
            if let Some(entry) = reader.get_entry_by_path(&prefixed) {
                return Some(entry);
            }
        }
    }
    None
}

pub fn etag_for(archive: &str, path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{archive}/{path}").as_bytes());
    let digest: String = hasher.finalize().iter().map(|b| format!("{b:02x}")).collect();
    format!("\"{}\"", &digest[..16])
}

/// Strip `<base ...>` tags (absolute or self-closing) from an HTML payload;
/// they point at the original online site and break in-archive relative
/// resolution.
pub fn strip_base_tags(html: &str) -> String {
    let re = regex::Regex::new(r"(?is)<base\b[^>]*>").unwrap();
    re.replace_all(html, "").into_owned()
}

/// One inclusive byte range, resolved against a known total length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

/// Parse a single-range `Range: bytes=start-end` header (suffix ranges
/// `bytes=-N` supported). Returns `None` for anything else — multi-range,
/// malformed, or absent — so the caller serves the full body.
pub fn parse_range(header: &str, total: u64) -> Option<ByteRange> {
    let spec = header.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start_str, end_str) = spec.split_once('-')?;
    if start_str.is_empty() {
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 || total == 0 {
            return None;
        }
        let start = total.saturating_sub(suffix_len);
        return Some(ByteRange { start, end: total - 1, total });
    }
    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() { total.saturating_sub(1) } else { end_str.parse().ok()? };
    if start > end || start >= total {
        return None;
    }
    Some(ByteRange { start, end: end.min(total - 1), total })
}

#[derive(Debug)]
pub enum ContentOutcome {
    /// Serve the front-end SPA shell instead of raw bytes (empty path,
    /// document navigation, or `?view=1`).
    Shell,
    /// 302 redirect to the canonical `/w/<archive>/<target>` URL.
    Redirect { location: String },
    TooLarge,
    NotFound,
    Body {
        mime: String,
        bytes: Vec<u8>,
        is_epub: bool,
        etag: String,
        range: Option<ByteRange>,
        accept_ranges: bool,
    },
}

/// The full content-serving decision, independent
/// of any HTTP framework so it can be unit tested without spinning up axum.
#[allow(clippy::too_many_arguments)]
pub fn resolve_content(
    reader: &dyn ZimReader,
    archive: &str,
    entry_path: &str,
    raw: bool,
    view: bool,
    is_document_navigation: bool,
    range_header: Option<&str>,
) -> ContentOutcome {
    if entry_path.is_empty() || (is_document_navigation && !raw) {
        return ContentOutcome::Shell;
    }

    let Some(entry) = resolve_entry(reader, entry_path) else {
        return ContentOutcome::NotFound;
    };

    if let Some(target) = &entry.redirect_target {
        return ContentOutcome::Redirect { location: format!("/w/{archive}/{target}") };
    }

    let mut mime = if entry.mimetype.is_empty() || !entry.mimetype.contains('/') {
        mime_from_extension(&entry.path).unwrap_or("application/octet-stream").to_string()
    } else {
        entry.mimetype.clone()
    };
    if entry.path.to_lowercase().ends_with(".pdf") && mime == "text/html" {
        mime = "application/pdf".to_string();
    }
    let is_epub = mime == "application/epub+zip" || entry.path.to_lowercase().ends_with(".epub");
    if view && mime == "application/pdf" {
        // `?view=1` forces the SPA shell to own the URL for PDFs so CDNs
        // never cache the raw bytes under a URL the client-side router needs.
        return ContentOutcome::Shell;
    }

    let total = entry.size();
    let streamable = is_streamable(&mime);
    if !streamable && total > MAX_SERVE_BYTES {
        return ContentOutcome::TooLarge;
    }

    let range = if streamable { range_header.and_then(|h| parse_range(h, total)) } else { None };

    let mut bytes = entry.content;
    if mime == "text/html" {
        let html = String::from_utf8_lossy(&bytes).into_owned();
        bytes = strip_base_tags(&html).into_bytes();
    }

    let etag = etag_for(archive, &entry.path);
    ContentOutcome::Body { mime, bytes, is_epub, etag, range, accept_ranges: streamable }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zimi_core::reader::{MockZimReader, ZimMetadata};

    fn entry(path: &str, mimetype: &str, content: &[u8]) -> ZimEntry {
        ZimEntry { path: path.into(), title: path.into(), mimetype: mimetype.into(), content: content.to_vec(), redirect_target: None }
    }

    fn reader_with(entries: Vec<ZimEntry>) -> MockZimReader {
        MockZimReader::new(entries, ZimMetadata::default())
    }

    #[test]
    fn empty_path_serves_shell() {
        let r = reader_with(vec![]);
        let outcome = resolve_content(&r, "wikipedia", "", false, false, false, None);
        assert!(matches!(outcome, ContentOutcome::Shell));
    }

    #[test]
    fn document_navigation_serves_shell_unless_raw() {
        let r = reader_with(vec![entry("A/Home", "text/html", b"<html></html>")]);
        assert!(matches!(resolve_content(&r, "z", "A/Home", false, false, true, None), ContentOutcome::Shell));
        assert!(matches!(resolve_content(&r, "z", "A/Home", true, false, true, None), ContentOutcome::Body { .. }));
    }

    #[test]
    fn redirect_entry_yields_302_to_canonical_path() {
        let mut target = entry("A/Real", "text/html", b"hi");
        target.path = "A/Real".into();
        let mut redirecting = entry("A/Alias", "", b"");
        redirecting.redirect_target = Some("A/Real".into());
        let r = reader_with(vec![redirecting, target]);
        let outcome = resolve_content(&r, "z", "A/Alias", false, false, false, None);
        match outcome {
            ContentOutcome::Redirect { location } => assert_eq!(location, "/w/z/A/Real"),
            other => panic!("expected redirect, got {other:?}"),
        }
    }

    #[test]
    fn namespace_prefix_fallback_finds_entry_without_prefix() {
        let r = reader_with(vec![entry("Home", "text/html", b"hi")]);
        let outcome = resolve_content(&r, "z", "A/Home", false, false, false, None);
        assert!(matches!(outcome, ContentOutcome::Body { .. }));
    }

    #[test]
    fn pdf_mislabeled_as_html_is_forced_to_pdf_mime() {
        let r = reader_with(vec![entry("A/doc.pdf", "text/html", b"%PDF-1.4")]);
        match resolve_content(&r, "z", "A/doc.pdf", true, false, false, None) {
            ContentOutcome::Body { mime, .. } => assert_eq!(mime, "application/pdf"),
            other => panic!("expected body, got {other:?}"),
        }
    }

    #[test]
    fn oversized_non_streamable_entry_is_rejected() {
        let big = vec![0u8; (MAX_SERVE_BYTES + 1) as usize];
        let r = reader_with(vec![entry("A/big.bin", "application/octet-stream", &big)]);
        let outcome = resolve_content(&r, "z", "A/big.bin", true, false, false, None);
        assert!(matches!(outcome, ContentOutcome::TooLarge));
    }

    #[test]
    fn streamable_media_has_no_size_ceiling_and_honors_range() {
        let media = vec![1u8; (MAX_SERVE_BYTES + 1000) as usize];
        let r = reader_with(vec![entry("A/movie.mp4", "video/mp4", &media)]);
        match resolve_content(&r, "z", "A/movie.mp4", true, false, false, Some("bytes=0-99")) {
            ContentOutcome::Body { range: Some(range), accept_ranges, .. } => {
                assert!(accept_ranges);
                assert_eq!((range.start, range.end), (0, 99));
            }
            other => panic!("expected ranged body, got {other:?}"),
        }
    }

    #[test]
    fn base_tags_are_stripped_from_html() {
        let html = r#"<html><head><base href="https://en.wikipedia.org/"></head><body>hi</body></html>"#;
        let stripped = strip_base_tags(html);
        assert!(!stripped.contains("<base"));
    }

    #[test]
    fn parse_range_handles_suffix_ranges() {
        let range = parse_range("bytes=-500", 1000).unwrap();
        assert_eq!((range.start, range.end), (500, 999));
    }

    #[test]
    fn parse_range_rejects_multi_range() {
        assert!(parse_range("bytes=0-10,20-30", 1000).is_none());
    }

    #[test]
    fn missing_entry_is_not_found() {
        let r = reader_with(vec![]);
        assert!(matches!(resolve_content(&r, "z", "A/Nope", true, false, false, None), ContentOutcome::NotFound));
    }
}
