//! Core data models for domain enrichment

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod af_time;
pub mod domain_utils;

/// Label used for every field of the assessment sentinel
pub const LOW_PRIORITY_TAGS: &str = "Low Priority Tags";

/// Class of an AutoFocus tag, in descending assessment precedence
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TagClass {
    Campaign,
    Actor,
    MalwareFamily,
    /// Only produced by the assessor when nothing of interest was found
    #[serde(rename = "Low Priority Tags")]
    LowPriority,
    #[default]
    #[serde(other)]
    Other,
}

/// AutoFocus leaves `tag_class` null for some tags; those are never assessed
fn class_or_other<'de, D>(deserializer: D) -> Result<TagClass, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<TagClass>::deserialize(deserializer)?.unwrap_or_default())
}

impl std::fmt::Display for TagClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TagClass::Campaign => write!(f, "campaign"),
            TagClass::Actor => write!(f, "actor"),
            TagClass::MalwareFamily => write!(f, "malware_family"),
            TagClass::LowPriority => write!(f, "{}", LOW_PRIORITY_TAGS),
            TagClass::Other => write!(f, "other"),
        }
    }
}

/// Flattened tag metadata attached to a sample
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagRecord {
    pub tag_name: String,
    pub public_tag_name: String,
    pub tag_class: TagClass,
    pub tag_group: String,
    pub description: String,
}

/// One malware sample that referenced a domain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SampleRecord {
    pub sample_date: DateTime<Utc>,
    pub file_type: String,
    pub tags: Vec<TagRecord>,
}

/// The single tag picked to classify a domain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssessedTag {
    pub tag_name: String,
    pub public_tag_name: String,
    pub tag_class: TagClass,
    pub sample_date: DateTime<Utc>,
    pub file_type: String,
    pub tag_group: String,
    pub description: String,
    pub confidence_level: u8,
}

impl AssessedTag {
    pub fn from_tag(tag: &TagRecord, sample: &SampleRecord, confidence_level: u8) -> Self {
        Self {
            tag_name: tag.tag_name.clone(),
            public_tag_name: tag.public_tag_name.clone(),
            tag_class: tag.tag_class,
            sample_date: sample.sample_date,
            file_type: sample.file_type.clone(),
            tag_group: tag.tag_group.clone(),
            description: tag.description.clone(),
            confidence_level,
        }
    }

    /// Sentinel returned when no sample carries a campaign, actor or malware tag
    pub fn low_priority() -> Self {
        Self {
            tag_name: LOW_PRIORITY_TAGS.to_string(),
            public_tag_name: LOW_PRIORITY_TAGS.to_string(),
            tag_class: TagClass::LowPriority,
            sample_date: placeholder_date(),
            file_type: LOW_PRIORITY_TAGS.to_string(),
            tag_group: LOW_PRIORITY_TAGS.to_string(),
            description: LOW_PRIORITY_TAGS.to_string(),
            confidence_level: 0,
        }
    }

    pub fn is_low_priority(&self) -> bool {
        self.tag_class == TagClass::LowPriority
    }
}

/// 2000-01-01T00:00:00, used where no real sample date exists
pub fn placeholder_date() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

/// AutoFocus point bucket state as reported in `bucket_info`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BucketState {
    pub minute_points: i64,
    pub minute_points_remaining: i64,
    pub daily_points: i64,
    pub daily_points_remaining: i64,
    #[serde(with = "af_time")]
    pub minute_bucket_start: DateTime<Utc>,
    #[serde(with = "af_time")]
    pub daily_bucket_start: DateTime<Utc>,
}

impl BucketState {
    #[cfg(test)]
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            minute_points: 0,
            minute_points_remaining: 0,
            daily_points: 0,
            daily_points_remaining: 0,
            minute_bucket_start: now,
            daily_bucket_start: now,
        }
    }

    /// Remaining balances never exceed their allowances
    pub fn is_consistent(&self) -> bool {
        self.minute_points_remaining <= self.minute_points
            && self.daily_points_remaining <= self.daily_points
    }
}

/// Kinds of documents kept in the local cache
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum DocKind {
    Domain,
    Tag,
    AfDetails,
}

impl DocKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocKind::Domain => "domain",
            DocKind::Tag => "tag",
            DocKind::AfDetails => "af-details",
        }
    }
}

impl std::fmt::Display for DocKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage envelope for any cached document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredDocument {
    pub kind: DocKind,
    pub id: String,
    pub body: Value,
    pub doc_created: DateTime<Utc>,
    pub doc_updated: DateTime<Utc>,
}

/// Cached sample history for a domain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainDoc {
    pub name: String,
    pub samples: Vec<SampleRecord>,
    pub doc_created: DateTime<Utc>,
    pub doc_updated: DateTime<Utc>,
}

/// Tag metadata as AutoFocus reports it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagInfo {
    pub tag_name: String,
    pub public_tag_name: String,
    #[serde(default, deserialize_with = "class_or_other")]
    pub tag_class: TagClass,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagGroup {
    pub tag_group_name: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl TagGroup {
    pub fn undefined() -> Self {
        Self {
            tag_group_name: "Undefined".to_string(),
            description: Some("Tag has not been assigned to a group".to_string()),
        }
    }
}

/// Cached tag details
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TagDoc {
    pub name: String,
    pub tag: TagInfo,
    pub tag_groups: Vec<TagGroup>,
    pub doc_created: DateTime<Utc>,
    pub doc_updated: DateTime<Utc>,
}

impl TagDoc {
    /// Flatten into the record shape used by samples; the first group wins
    pub fn to_record(&self) -> TagRecord {
        let group = self
            .tag_groups
            .first()
            .cloned()
            .unwrap_or_else(TagGroup::undefined);

        TagRecord {
            tag_name: self.tag.tag_name.clone(),
            public_tag_name: self.tag.public_tag_name.clone(),
            tag_class: self.tag.tag_class,
            tag_group: group.tag_group_name,
            description: self.tag.description.clone().unwrap_or_default(),
        }
    }
}

/// Result of enriching one domain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainEnrichment {
    pub domain: String,
    pub assessed: AssessedTag,
    pub sample_count: usize,
    pub doc_updated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_tag_class_is_other() {
        let class: TagClass = serde_json::from_str("\"malicious_behavior\"").unwrap();
        assert_eq!(class, TagClass::Other);

        let class: TagClass = serde_json::from_str("\"malware_family\"").unwrap();
        assert_eq!(class, TagClass::MalwareFamily);
    }

    #[test]
    fn test_low_priority_sentinel() {
        let sentinel = AssessedTag::low_priority();
        assert_eq!(sentinel.confidence_level, 0);
        assert_eq!(sentinel.tag_name, LOW_PRIORITY_TAGS);
        assert_eq!(
            sentinel.sample_date.format("%Y-%m-%dT%H:%M:%S").to_string(),
            "2000-01-01T00:00:00"
        );
        assert_eq!(
            serde_json::to_value(sentinel.tag_class).unwrap(),
            serde_json::json!("Low Priority Tags")
        );
    }

    #[test]
    fn test_tag_doc_without_groups_is_undefined() {
        let doc = TagDoc {
            name: "Zeus".into(),
            tag: TagInfo {
                tag_name: "Unit42.Zeus".into(),
                public_tag_name: "Unit42.Zeus".into(),
                tag_class: TagClass::MalwareFamily,
                description: None,
            },
            tag_groups: vec![],
            doc_created: Utc::now(),
            doc_updated: Utc::now(),
        };

        let record = doc.to_record();
        assert_eq!(record.tag_group, "Undefined");
        assert_eq!(record.description, "");
    }

    #[test]
    fn test_bucket_state_consistency() {
        let mut bucket = BucketState::empty(Utc::now());
        bucket.daily_points = 100;
        bucket.daily_points_remaining = 50;
        assert!(bucket.is_consistent());

        bucket.minute_points_remaining = 1;
        assert!(!bucket.is_consistent());
    }
}
