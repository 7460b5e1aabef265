//! Tag assessment: pick the one tag that best classifies a domain

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::ConfidenceLevels;
use crate::models::{AssessedTag, SampleRecord, TagClass};

pub const CAMPAIGN_CONFIDENCE: u8 = 90;
pub const ACTOR_CONFIDENCE: u8 = 90;

/// Determine the most relevant tag across a domain's samples.
///
/// Samples are walked in order, tags in order within each sample:
/// a campaign tag ends the walk immediately; an actor tag is kept (a later
/// actor replaces it) while the walk continues; the first malware family tag
/// is kept only if nothing better has been seen, scored by sample age.
pub fn assess(samples: &[SampleRecord], levels: &ConfidenceLevels, now: DateTime<Utc>) -> AssessedTag {
    let mut selected: Option<AssessedTag> = None;

    for sample in samples {
        for tag in &sample.tags {
            debug!(tag = %tag.tag_name, class = %tag.tag_class, "Assessing tag");

            match tag.tag_class {
                TagClass::Campaign => {
                    let assessed = AssessedTag::from_tag(tag, sample, CAMPAIGN_CONFIDENCE);
                    debug!(tag = %assessed.tag_name, "Campaign tag found, done assessing");
                    return assessed;
                }
                TagClass::Actor => {
                    selected = Some(AssessedTag::from_tag(tag, sample, ACTOR_CONFIDENCE));
                }
                TagClass::MalwareFamily if selected.is_none() => {
                    let age_days = (now - sample.sample_date).num_days();
                    let confidence = levels.confidence_for_age(age_days);
                    debug!(
                        tag = %tag.tag_name,
                        age_days,
                        confidence,
                        "Scored malware family tag by age"
                    );
                    selected = Some(AssessedTag::from_tag(tag, sample, confidence));
                }
                _ => {}
            }
        }
    }

    selected.unwrap_or_else(AssessedTag::low_priority)
}
