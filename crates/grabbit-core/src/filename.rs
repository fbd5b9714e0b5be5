//! Filename resolution and sanitization
//!
//! A task's storage name (and registry key) is resolved from, in order:
//! 1. the server-declared Content-Disposition filename
//! 2. the last path segment of the URL
//! 3. a `file` query parameter
//! 4. a generated timestamp-based name
//!
//! Every candidate is sanitized; a candidate that sanitizes to nothing falls
//! through to the next step.

use crate::dedup::PART_SUFFIX;
use chrono::Utc;
use url::Url;

/// Resolve the storage name for a download
pub fn resolve_filename(url: &Url, content_disposition: Option<&str>) -> String {
    content_disposition
        .and_then(parse_content_disposition)
        .and_then(|name| sanitize_filename(&name))
        .or_else(|| last_path_segment(url).and_then(|name| sanitize_filename(&name)))
        .or_else(|| file_query_param(url).and_then(|name| sanitize_filename(&name)))
        .unwrap_or_else(generated_name)
}

/// Parses a Content-Disposition header value
///
/// Handles `filename*=UTF-8''...` (RFC 5987) before the plain
/// `filename="..."` / `filename=...` forms. Parameter names match in any case.
pub fn parse_content_disposition(header: &str) -> Option<String> {
    // ASCII lowercasing keeps byte offsets valid for `header`
    let lower = header.to_ascii_lowercase();

    if let Some(pos) = lower.find("filename*=") {
        let value = header[pos + 10..].trim();
        if let Some(quote_pos) = value.find("''") {
            let encoded = &value[quote_pos + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            let encoded = encoded[..end].trim().trim_matches('"');
            if let Ok(decoded) = urlencoding::decode(encoded) {
                if !decoded.is_empty() {
                    return Some(decoded.into_owned());
                }
            }
        }
    }

    let pos = lower.find("filename=")?;
    let value = header[pos + 9..].trim();

    if let Some(stripped) = value.strip_prefix('"') {
        let end = stripped.find('"')?;
        let name = &stripped[..end];
        return (!name.is_empty()).then(|| name.to_string());
    }

    let end = value.find(';').unwrap_or(value.len());
    let name = value[..end].trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// Reduce a name to a safe flat filename
///
/// Keeps ASCII alphanumerics, `-`, `_` and `.`; any other run of characters
/// (path separators included) collapses to a single `_`. A trailing `.part`
/// becomes `_part` so no stored name can pass for an in-progress transfer.
/// Returns `None` when nothing usable is left.
pub fn sanitize_filename(name: &str) -> Option<String> {
    // Only the final component of anything path-like is kept
    let name = name.rsplit(['/', '\\']).next().unwrap_or(name);

    let mut out = String::with_capacity(name.len());
    let mut prev_sep = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '.') {
            out.push(ch);
            prev_sep = false;
        } else if !prev_sep {
            out.push('_');
            prev_sep = true;
        }
    }

    let mut trimmed = out
        .trim_start_matches(['.', '_'])
        .trim_end_matches(['_', '.'])
        .to_string();
    if let Some(stem) = trimmed.strip_suffix(PART_SUFFIX) {
        trimmed = format!("{}_part", stem);
    }

    if trimmed.is_empty() || trimmed.chars().all(|c| c == '.') {
        None
    } else {
        Some(trimmed)
    }
}

/// Make `candidate` unique by inserting `_1`, `_2`, ... before the extension
pub fn unique_name(candidate: &str, is_taken: impl Fn(&str) -> bool) -> String {
    if !is_taken(candidate) {
        return candidate.to_string();
    }

    let (stem, ext) = split_extension(candidate);
    let mut counter = 1u32;
    loop {
        let name = format!("{}_{}{}", stem, counter, ext);
        if !is_taken(&name) {
            return name;
        }
        counter += 1;
    }
}

fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    }
}

fn last_path_segment(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.next_back()?;
    if segment.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string());
    Some(decoded)
}

fn file_query_param(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == "file")
        .map(|(_, value)| value.into_owned())
}

fn generated_name() -> String {
    format!("download_{}", Utc::now().format("%Y%m%d_%H%M%S_%3f"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn content_disposition_wins() {
        let name = resolve_filename(
            &url("https://example.com/files/ignored.bin"),
            Some("attachment; filename=\"report 2024.pdf\""),
        );
        assert_eq!(name, "report_2024.pdf");
    }

    #[test]
    fn rfc5987_filename_is_decoded() {
        assert_eq!(
            parse_content_disposition("attachment; filename*=UTF-8''na%C3%AFve%20notes.txt"),
            Some("naïve notes.txt".to_string())
        );
        assert_eq!(
            parse_content_disposition("attachment; filename=plain.zip; size=3"),
            Some("plain.zip".to_string())
        );
        assert_eq!(parse_content_disposition("inline"), None);
    }

    #[test]
    fn disposition_parameter_names_ignore_case() {
        assert_eq!(
            parse_content_disposition("attachment; FileName=\"Budget.XLSX\""),
            Some("Budget.XLSX".to_string())
        );
        assert_eq!(
            parse_content_disposition("attachment; FILENAME*=UTF-8''%C3%A9t%C3%A9.txt"),
            Some("été.txt".to_string())
        );
    }

    #[test]
    fn partial_suffix_is_never_a_stored_name() {
        assert_eq!(sanitize_filename("backup.part"), Some("backup_part".to_string()));
        assert_eq!(sanitize_filename("disk.img.part."), Some("disk.img_part".to_string()));
        assert_eq!(sanitize_filename("spare.parts"), Some("spare.parts".to_string()));
        assert_eq!(
            resolve_filename(&url("https://example.com/dl/backup.part"), None),
            "backup_part"
        );
    }

    #[test]
    fn falls_back_to_url_path() {
        let name = resolve_filename(&url("https://example.com/a/b/archive.tar.gz?x=1"), None);
        assert_eq!(name, "archive.tar.gz");
    }

    #[test]
    fn falls_back_to_file_query_param() {
        let name = resolve_filename(&url("https://example.com/get/?file=data.csv"), None);
        assert_eq!(name, "data.csv");
    }

    #[test]
    fn falls_back_to_generated_name() {
        let name = resolve_filename(&url("https://example.com/"), None);
        assert!(name.starts_with("download_"), "{name}");
        assert!(sanitize_filename(&name).is_some());
    }

    #[test]
    fn sanitizing_strips_traversal_and_unsafe_characters() {
        assert_eq!(sanitize_filename("../../etc/passwd"), Some("passwd".to_string()));
        assert_eq!(sanitize_filename("..\\boot.ini"), Some("boot.ini".to_string()));
        assert_eq!(sanitize_filename("a:b*c?.txt"), Some("a_b_c_.txt".to_string()));
        assert_eq!(sanitize_filename(".hidden"), Some("hidden".to_string()));
        assert_eq!(sanitize_filename(".."), None);
        assert_eq!(sanitize_filename("???"), None);
    }

    #[test]
    fn unusable_disposition_falls_through_to_path() {
        let name = resolve_filename(
            &url("https://example.com/real.iso"),
            Some("attachment; filename=\"..\""),
        );
        assert_eq!(name, "real.iso");
    }

    #[test]
    fn unique_name_inserts_counter_before_extension() {
        let taken = ["movie.mkv", "movie_1.mkv"];
        assert_eq!(unique_name("movie.mkv", |n| taken.contains(&n)), "movie_2.mkv");
        assert_eq!(unique_name("README", |n| n == "README"), "README_1");
        assert_eq!(unique_name("fresh.txt", |_| false), "fresh.txt");
    }
}
