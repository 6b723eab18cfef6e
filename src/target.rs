//! Target identifiers and the URL validity predicate.
//!
//! A target is an opaque product-page URL plus the caller's row correlation
//! id. Validation is a pure format check: scheme must be http(s) and the
//! host must belong to one of the regional marketplace domains. Whether the
//! URL actually resolves to a product page is decided later, from rendered
//! markup.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Regional marketplace domains accepted by the scanner. Subdomains of
/// these (e.g. `www.`) are accepted too.
const ALLOWED_DOMAINS: &[&str] = &[
    "amazon.de",
    "amazon.fr",
    "amazon.it",
    "amazon.es",
    "amazon.nl",
    "amazon.be",
    "amazon.se",
    "amazon.pl",
    "amazon.co.uk",
    "amazon.ie",
];

/// Why a target string failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    #[error("target is missing or empty")]
    Missing,
    #[error("target is not a valid http(s) URL: {0}")]
    InvalidFormat(String),
    #[error("host {0} is not a supported marketplace domain")]
    UnsupportedDomain(String),
}

impl TargetError {
    /// Stable wire code for the REST layer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Missing => "MISSING_TARGET",
            Self::InvalidFormat(_) => "INVALID_FORMAT",
            Self::UnsupportedDomain(_) => "NOT_SUPPORTED_DOMAIN",
        }
    }
}

/// One input to the pipeline: a product-page URL and the caller's row id.
/// Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub row: u64,
    pub url: String,
}

impl Target {
    pub fn new(row: u64, url: impl Into<String>) -> Self {
        Self {
            row,
            url: url.into(),
        }
    }

    /// Run the format validity predicate on this target's URL.
    pub fn validate(&self) -> Result<(), TargetError> {
        validate_url(&self.url)
    }
}

/// Check that a raw string is an http(s) URL on an allowed marketplace
/// domain.
pub fn validate_url(raw: &str) -> Result<(), TargetError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TargetError::Missing);
    }

    let url = Url::parse(trimmed).map_err(|e| TargetError::InvalidFormat(e.to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(TargetError::InvalidFormat(format!(
                "unsupported scheme: {other}"
            )))
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| TargetError::InvalidFormat("missing host".to_string()))?
        .to_ascii_lowercase();

    let allowed = ALLOWED_DOMAINS
        .iter()
        .any(|d| host == *d || host.ends_with(&format!(".{d}")));
    if !allowed {
        return Err(TargetError::UnsupportedDomain(host));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_targets() {
        for url in [
            "https://www.amazon.de/dp/B07PGL2ZSL",
            "https://amazon.fr/dp/B0TEST",
            "http://www.amazon.co.uk/gp/product/B000000",
            "https://smile.amazon.nl/dp/X",
        ] {
            assert!(validate_url(url).is_ok(), "expected valid: {url}");
        }
    }

    #[test]
    fn test_missing_target() {
        assert_eq!(validate_url(""), Err(TargetError::Missing));
        assert_eq!(validate_url("   "), Err(TargetError::Missing));
    }

    #[test]
    fn test_invalid_format() {
        assert!(matches!(
            validate_url("not a url"),
            Err(TargetError::InvalidFormat(_))
        ));
        assert!(matches!(
            validate_url("ftp://amazon.de/dp/B0"),
            Err(TargetError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_unsupported_domain() {
        assert!(matches!(
            validate_url("https://www.amazon.com/dp/B0"),
            Err(TargetError::UnsupportedDomain(_))
        ));
        assert!(matches!(
            validate_url("https://example.com/dp/B0"),
            Err(TargetError::UnsupportedDomain(_))
        ));
        // Lookalike host must not pass the suffix check
        assert!(matches!(
            validate_url("https://notamazon.de/dp/B0"),
            Err(TargetError::UnsupportedDomain(_))
        ));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(TargetError::Missing.code(), "MISSING_TARGET");
        assert_eq!(
            TargetError::InvalidFormat(String::new()).code(),
            "INVALID_FORMAT"
        );
        assert_eq!(
            TargetError::UnsupportedDomain(String::new()).code(),
            "NOT_SUPPORTED_DOMAIN"
        );
    }
}
