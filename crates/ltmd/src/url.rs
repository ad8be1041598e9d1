//! Public URL detection from the relay client's output.
//!
//! The relay client prints status lines to its output log; the most
//! recently announced URL is authoritative, so the log is scanned from
//! the end. The file may be mid-write while we read it: invalid UTF-8 is
//! replaced and a truncated last line simply fails validation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use ltm_core::{TunnelError, TunnelResult};
use regex::Regex;
use tracing::{debug, warn};
use url::Url;

/// A scheme followed by everything up to whitespace, a quote or a bracket.
///
/// `None` only if the pattern fails to compile, in which case no URL is
/// ever found.
static URL_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s"'<>`]+"#).ok());

/// Source of the tunnel's current public URL.
pub trait UrlSource: Send + Sync {
    /// Most recent valid URL announced by the tunnel, if any.
    fn read_current_url(&self) -> Option<String>;
}

/// Reads the URL from the relay client's output log.
#[derive(Debug, Clone)]
pub struct LogUrlExtractor {
    path: PathBuf,
}

impl LogUrlExtractor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl UrlSource for LogUrlExtractor {
    fn read_current_url(&self) -> Option<String> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Tunnel output log does not exist");
                return None;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read tunnel output log");
                return None;
            }
        };
        let url = last_url_in(&String::from_utf8_lossy(&bytes));
        if let Some(ref url) = url {
            debug!(url = %url, "Found tunnel URL in output log");
        }
        url
    }
}

/// Scans `text` from the last line backwards for a valid http(s) URL.
pub fn last_url_in(text: &str) -> Option<String> {
    text.lines().rev().find_map(url_in_line)
}

/// First valid http(s) URL on a line.
pub fn url_in_line(line: &str) -> Option<String> {
    let pattern = URL_PATTERN.as_ref()?;
    pattern.find_iter(line).find_map(|m| {
        let token = m
            .as_str()
            .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ')' | ']'));
        validate_url(token).ok().map(|_| token.to_string())
    })
}

/// Checks that `url` is an absolute http(s) URL with a host.
pub fn validate_url(url: &str) -> TunnelResult<Url> {
    let parsed = Url::parse(url).map_err(|_| TunnelError::InvalidUrl(url.to_string()))?;
    let scheme_ok = matches!(parsed.scheme(), "http" | "https");
    let host_ok = parsed.host_str().is_some_and(|h| !h.is_empty());
    if scheme_ok && host_ok {
        Ok(parsed)
    } else {
        Err(TunnelError::InvalidUrl(url.to_string()))
    }
}

/// Relay subdomain of a tunnel URL: `https://abc.loca.lt` gives `abc`.
///
/// Hosts with fewer than three labels have no subdomain.
pub fn subdomain_of(url: &str) -> Option<String> {
    let parsed = validate_url(url).ok()?;
    let host = parsed.host_str()?;
    let mut labels = host.split('.');
    let first = labels.next()?;
    (labels.count() >= 2 && !first.is_empty()).then(|| first.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_announcement_line() {
        assert_eq!(
            url_in_line("your url is: https://abc.loca.lt").as_deref(),
            Some("https://abc.loca.lt")
        );
    }

    #[test]
    fn test_url_embedded_in_text() {
        assert_eq!(
            url_in_line("tunnel ready at (https://abc.loca.lt).").as_deref(),
            Some("https://abc.loca.lt")
        );
    }

    #[test]
    fn test_url_stops_at_quotes_and_brackets() {
        assert_eq!(
            url_in_line(r#"{"url":"https://abc.loca.lt","ok":true}"#).as_deref(),
            Some("https://abc.loca.lt")
        );
        assert_eq!(
            url_in_line("see <http://127.0.0.1:3000/x> now").as_deref(),
            Some("http://127.0.0.1:3000/x")
        );
    }

    #[test]
    fn test_skips_invalid_candidate() {
        assert_eq!(
            url_in_line("https://, then https://abc.loca.lt").as_deref(),
            Some("https://abc.loca.lt")
        );
    }

    #[test]
    fn test_no_url() {
        assert_eq!(url_in_line("connecting to relay..."), None);
        assert_eq!(url_in_line("https://"), None);
        assert_eq!(url_in_line("ftp://files.example.com"), None);
    }

    #[test]
    fn test_last_url_wins() {
        let log = "your url is: https://first.loca.lt\n\
                   connection lost\n\
                   your url is: https://second.loca.lt\n\
                   tunnel up\n";
        assert_eq!(last_url_in(log).as_deref(), Some("https://second.loca.lt"));
    }

    #[test]
    fn test_partial_last_line() {
        let log = "your url is: https://good.loca.lt\nyour url is: https://";
        assert_eq!(last_url_in(log).as_deref(), Some("https://good.loca.lt"));
    }

    #[test]
    fn test_extractor_missing_file() {
        let dir = TempDir::new().unwrap();
        let extractor = LogUrlExtractor::new(dir.path().join("missing.log"));
        assert_eq!(extractor.read_current_url(), None);
    }

    #[test]
    fn test_extractor_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.log");
        fs::write(&path, "").unwrap();
        assert_eq!(LogUrlExtractor::new(&path).read_current_url(), None);
    }

    #[test]
    fn test_extractor_tolerates_invalid_utf8() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.log");
        let mut bytes = b"your url is: https://abc.loca.lt\n".to_vec();
        bytes.extend_from_slice(&[0xf0, 0x9f, 0x98]);
        fs::write(&path, bytes).unwrap();
        assert_eq!(
            LogUrlExtractor::new(&path).read_current_url().as_deref(),
            Some("https://abc.loca.lt")
        );
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://abc.loca.lt").is_ok());
        assert!(validate_url("http://127.0.0.1:3000/x").is_ok());
        assert!(validate_url("ftp://abc.loca.lt").is_err());
        assert!(validate_url("abc.loca.lt").is_err());
        assert!(validate_url("").is_err());
    }

    #[test]
    fn test_subdomain_of() {
        assert_eq!(subdomain_of("https://abc.loca.lt").as_deref(), Some("abc"));
        assert_eq!(subdomain_of("https://example.com"), None);
        assert_eq!(subdomain_of("not a url"), None);
    }
}
