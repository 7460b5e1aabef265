//! Runtime settings for the enrichment pipeline

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::EnrichError;

/// Confidence given to a malware family tag older than every threshold
pub const DEFAULT_CONFIDENCE: u8 = 5;

/// Day-threshold to confidence mapping used for malware family tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfidenceLevels(BTreeMap<i64, u8>);

impl ConfidenceLevels {
    pub fn new(levels: impl IntoIterator<Item = (i64, u8)>) -> Self {
        Self(levels.into_iter().collect())
    }

    /// Confidence for the first threshold strictly greater than `age_days`
    pub fn confidence_for_age(&self, age_days: i64) -> u8 {
        self.0
            .iter()
            .find(|(threshold, _)| age_days < **threshold)
            .map(|(_, confidence)| *confidence)
            .unwrap_or(DEFAULT_CONFIDENCE)
    }
}

impl Default for ConfidenceLevels {
    fn default() -> Self {
        Self::new([(7, 80), (30, 50), (90, 20)])
    }
}

/// Accepts JSON `{"7": 80}`, or `{7: 80, 30: 50}` as written in .panrc files
impl FromStr for ConfidenceLevels {
    type Err = EnrichError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let pairs: Vec<(String, String)> = match serde_json::from_str::<BTreeMap<String, u8>>(s) {
            Ok(map) => map
                .into_iter()
                .map(|(days, confidence)| (days, confidence.to_string()))
                .collect(),
            Err(_) => dict_pairs(s)?,
        };

        let mut levels = BTreeMap::new();

        for (days, confidence) in pairs {
            let threshold: i64 = days.trim().parse().map_err(|_| {
                EnrichError::Config(format!("CONFIDENCE_LEVELS threshold is not a number: {}", days))
            })?;
            let level: u8 = confidence
                .parse()
                .ok()
                .filter(|c| *c <= 100)
                .ok_or_else(|| {
                    EnrichError::Config(format!(
                        "CONFIDENCE_LEVELS confidence must be 0-100: {}",
                        confidence
                    ))
                })?;

            levels.insert(threshold, level);
        }

        Ok(Self(levels))
    }
}

/// Split a Python dict literal into its key/value strings
fn dict_pairs(s: &str) -> Result<Vec<(String, String)>, EnrichError> {
    let inner = s
        .trim()
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .ok_or_else(|| EnrichError::Config(format!("CONFIDENCE_LEVELS must be a mapping: {}", s)))?;

    inner
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|pair| {
            let (days, confidence) = pair.split_once(':').ok_or_else(|| {
                EnrichError::Config(format!("CONFIDENCE_LEVELS entry without ':': {}", pair))
            })?;
            Ok((unquote(days).to_string(), unquote(confidence).to_string()))
        })
        .collect()
}

impl fmt::Display for ConfidenceLevels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: Vec<String> = self
            .0
            .iter()
            .map(|(days, confidence)| format!("{}: {}", days, confidence))
            .collect();
        write!(f, "{{{}}}", entries.join(", "))
    }
}

fn unquote(value: &str) -> &str {
    value.trim().trim_matches(|c| c == '"' || c == '\'')
}

/// Point budget thresholds (AF_POINT_NOEXEC, AF_POINTS_LOW, AF_NOEXEC_CKTIME)
#[derive(Debug, Clone)]
pub struct BudgetSettings {
    /// At or below this many daily points, stop querying until the bucket resets
    pub no_exec_points: i64,
    /// Below this many daily points, enrich one domain at a time
    pub low_points: i64,
    /// Sleep between budget probes while suspended
    pub no_exec_check_interval: Duration,
    /// Sleep after a minute bucket was exhausted
    pub minute_reset_wait: Duration,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            no_exec_points: 500,
            low_points: 5000,
            no_exec_check_interval: Duration::from_secs(900),
            minute_reset_wait: Duration::from_secs(60),
        }
    }
}

/// Search polling (AF_LOOKUP_TIMEOUT, AF_LOOKUP_MAX_PERCENTAGE)
#[derive(Debug, Clone)]
pub struct LookupSettings {
    /// Maximum number of result polls per search
    pub timeout_polls: u32,
    /// Completion percentage at which results are accepted
    pub max_percentage: u8,
    pub poll_interval: Duration,
    pub page_size: u32,
    /// In-flight enrichments when not in slow mode
    pub max_concurrency: usize,
}

impl Default for LookupSettings {
    fn default() -> Self {
        Self {
            timeout_polls: 5,
            max_percentage: 100,
            poll_interval: Duration::from_secs(61),
            page_size: 100,
            max_concurrency: 4,
        }
    }
}

/// Cache ages (DOMAIN_TAG_INFO_MAX_AGE, DNS_DOMAIN_INFO_MAX_AGE), in days
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub tag_max_age: chrono::Duration,
    pub domain_max_age: chrono::Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            tag_max_age: chrono::Duration::days(120),
            domain_max_age: chrono::Duration::days(30),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub budget: BudgetSettings,
    pub lookup: LookupSettings,
    pub cache: CacheSettings,
    pub confidence_levels: ConfidenceLevels,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_python_dict() {
        let levels: ConfidenceLevels = "{7: 80, 30: 50, 90: 20}".parse().unwrap();
        assert_eq!(levels, ConfidenceLevels::default());
    }

    #[test]
    fn test_parse_json_object() {
        let levels: ConfidenceLevels = r#"{"30": 50, "7": 80}"#.parse().unwrap();
        assert_eq!(levels, ConfidenceLevels::new([(7, 80), (30, 50)]));
        assert_eq!(levels.to_string(), "{7: 80, 30: 50}");
    }

    #[test]
    fn test_parse_json_validates_entries() {
        assert!(r#"{"seven": 80}"#.parse::<ConfidenceLevels>().is_err());
        assert!(r#"{"7": 180}"#.parse::<ConfidenceLevels>().is_err());

        let levels: ConfidenceLevels = r#"{" 90 ": 20}"#.parse().unwrap();
        assert_eq!(levels, ConfidenceLevels::new([(90, 20)]));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("7: 80".parse::<ConfidenceLevels>().is_err());
        assert!("{seven: 80}".parse::<ConfidenceLevels>().is_err());
        assert!("{7: 180}".parse::<ConfidenceLevels>().is_err());
        assert!("{7 80}".parse::<ConfidenceLevels>().is_err());
    }

    #[test]
    fn test_empty_mapping_uses_default_confidence() {
        let levels: ConfidenceLevels = "{}".parse().unwrap();
        assert_eq!(levels.confidence_for_age(0), DEFAULT_CONFIDENCE);
    }

    #[test]
    fn test_confidence_for_age() {
        let levels = ConfidenceLevels::new([(7, 80), (30, 50)]);
        assert_eq!(levels.confidence_for_age(0), 80);
        assert_eq!(levels.confidence_for_age(6), 80);
        assert_eq!(levels.confidence_for_age(7), 50);
        assert_eq!(levels.confidence_for_age(29), 50);
        assert_eq!(levels.confidence_for_age(30), DEFAULT_CONFIDENCE);
        assert_eq!(levels.confidence_for_age(400), DEFAULT_CONFIDENCE);
    }
}
