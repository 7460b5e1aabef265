// src/models/domain_utils.rs

use std::sync::LazyLock;

use regex::Regex;

static PARENTHESIZED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((.*)\)").expect("static regex"));

/// Pull the domain out of a release-notes signature cell.
///
/// Cells look like `Backdoor.simda:gahyraw.com` or
/// `Suspicious DNS Query (Worm.pykspa:agadss.biz)`. The domain is whatever
/// follows the first `:`, inside the parentheses when there are any.
pub fn extract_domain(cell: &str) -> Option<String> {
    let trimmed = cell.trim();

    let signature = PARENTHESIZED
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .unwrap_or(trimmed);

    signature.split(':').nth(1).map(|d| d.trim().to_string())
}

/// Normalize a domain for use as a cache key
pub fn normalize_domain(value: &str) -> String {
    value.trim().trim_end_matches('.').to_lowercase()
}

/// Loose syntax check applied before spending API points on a domain
pub fn is_plausible_domain(value: &str) -> bool {
    let trimmed = value.trim();

    !trimmed.is_empty()
        && trimmed.len() <= 253
        && trimmed.contains('.')
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_plain_cell() {
        assert_eq!(
            extract_domain("Backdoor.simda:gahyraw.com").as_deref(),
            Some("gahyraw.com")
        );
        assert_eq!(extract_domain("None:zief.pl").as_deref(), Some("zief.pl"));
    }

    #[test]
    fn test_extract_suspicious_query_cell() {
        assert_eq!(
            extract_domain("Suspicious DNS Query (Worm.pykspa:agadss.biz)").as_deref(),
            Some("agadss.biz")
        );
    }

    #[test]
    fn test_extract_keeps_leading_dot() {
        assert_eq!(
            extract_domain("Virus.palevogen:.banjalucke-ljepotice.ru").as_deref(),
            Some(".banjalucke-ljepotice.ru")
        );
    }

    #[test]
    fn test_extract_without_colon() {
        assert_eq!(extract_domain("gahyraw.com"), None);
        assert_eq!(extract_domain(""), None);
    }

    #[test]
    fn test_normalize_and_plausible() {
        assert_eq!(normalize_domain(" Irc.Zief.PL. "), "irc.zief.pl");
        assert!(is_plausible_domain("ryan12345.no-ip.biz"));
        assert!(!is_plausible_domain("not a domain"));
        assert!(!is_plausible_domain("localhost"));
    }
}
