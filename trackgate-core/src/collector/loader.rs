//! Measurement identifiers and loader script URLs

use crate::error::{Error, Result};

/// Validate a measurement identifier.
///
/// Accepts `G-` followed by an alphanumeric token, or the legacy
/// `UA-<digits>-<digits>` form.
pub fn validate_measurement_id(id: &str) -> Result<()> {
    if is_ga4_id(id) || is_legacy_id(id) {
        Ok(())
    } else {
        Err(Error::InvalidMeasurementId(id.to_string()))
    }
}

fn is_ga4_id(id: &str) -> bool {
    match id.strip_prefix("G-") {
        Some(token) => !token.is_empty() && token.chars().all(|c| c.is_ascii_alphanumeric()),
        None => false,
    }
}

fn is_legacy_id(id: &str) -> bool {
    let Some(rest) = id.strip_prefix("UA-") else {
        return false;
    };
    let mut parts = rest.split('-');
    let account = parts.next().unwrap_or_default();
    let property = parts.next().unwrap_or_default();
    parts.next().is_none() && is_digits(account) && is_digits(property)
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

/// `<loader_url>?id=<measurement id>`
pub fn loader_src(loader_url: &str, measurement_id: &str) -> String {
    format!(
        "{}?id={}",
        loader_url.trim_end_matches('?'),
        urlencoding::encode(measurement_id)
    )
}

/// Whether a script `src` points at the collector loader, whatever its
/// query string or scheme.
pub fn matches_loader(src: &str, loader_url: &str) -> bool {
    let base = strip_scheme(strip_query(loader_url));
    !base.is_empty() && strip_scheme(strip_query(src)).eq_ignore_ascii_case(base)
}

fn strip_query(url: &str) -> &str {
    url.split(['?', '#']).next().unwrap_or(url)
}

fn strip_scheme(url: &str) -> &str {
    match url.find("//") {
        Some(idx) => &url[idx + 2..],
        None => url,
    }
}
