//! Local filename derivation from download URLs.

#![allow(clippy::non_std_lazy_statics)]

use lazy_regex::lazy_regex;

/// Characters that are not allowed in file names on the target file systems.
static RE_ILLEGAL_CHARS: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r#"[\\/*?:"<>|]"#);

/// Derives a plain filename from a URL.
///
/// Takes everything after the last `/`, percent-decodes it and strips
/// `\ / * ? : " < > |`. The query string is not split off, it only loses the
/// illegal characters. Input without `/` is used as is. Never fails; invalid
/// UTF-8 in escapes is decoded lossily.
///
/// # Examples
///
/// ```
/// use debrid_relay::filename::resolve_filename;
/// assert_eq!(
///     resolve_filename("https://host.com/path/My%20File.zip?x=1"),
///     "My File.zipx=1"
/// );
/// assert_eq!(resolve_filename("plain.bin"), "plain.bin");
/// ```
#[must_use]
pub fn resolve_filename(url: &str) -> String {
    let segment = url.rsplit_once('/').map_or(url, |(_, last)| last);
    let decoded = urlencoding::decode_binary(segment.as_bytes());
    let decoded = String::from_utf8_lossy(&decoded);
    RE_ILLEGAL_CHARS.replace_all(&decoded, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_string_kept_without_illegal_chars() {
        assert_eq!(
            resolve_filename("https://host.com/path/My%20File.zip?x=1"),
            "My File.zipx=1"
        );
    }

    #[test]
    fn test_no_slash_passthrough() {
        assert_eq!(resolve_filename("archive.tar.gz"), "archive.tar.gz");
        assert_eq!(resolve_filename("what?.txt"), "what.txt");
    }

    #[test]
    fn test_trailing_slash_gives_empty_name() {
        assert_eq!(resolve_filename("https://host.com/dir/"), "");
    }

    #[test]
    fn test_encoded_illegal_chars_are_stripped_after_decoding() {
        // %2F is '/', %3A is ':'
        assert_eq!(
            resolve_filename("http://direct/a%2Fb%3Ac%22d%3C%3E%7C.bin"),
            "abcd.bin"
        );
    }

    #[test]
    fn test_invalid_utf8_escape_is_lossy() {
        let name = resolve_filename("http://direct/bad%FFname.bin");
        assert!(name.starts_with("bad"));
        assert!(name.ends_with("name.bin"));
    }

    #[test]
    fn test_unicode_name() {
        assert_eq!(
            resolve_filename("http://direct/%D0%A4%D0%B0%D0%B9%D0%BB.mkv"),
            "Файл.mkv"
        );
    }
}
