//! Content-derived identities.
//!
//! Record and reading IDs are pure functions of semantic content, so storage
//! can treat re-derivation as an upsert.

use sha2::{Digest, Sha256};

use crate::{config::Aggregation, domain::Unit, temporal::TimeWindow};

/// Bytes of digest kept in an ID (rendered as twice as many hex chars).
const ID_BYTES: usize = 16;

const RECORD_DOMAIN: &str = "meter-record/v1";

fn hash_str(hasher: &mut blake3::Hasher, s: &str) {
    let len = s.len() as u32;
    hasher.update(&len.to_le_bytes());
    hasher.update(s.as_bytes());
}

/// ID of the record metered from event `event_id`.
///
/// Depends on nothing but the event ID, so the same event always maps to the
/// same record no matter which extractions matched.
pub fn record_id(event_id: &str) -> String {
    let mut h = blake3::Hasher::new();
    hash_str(&mut h, RECORD_DOMAIN);
    hash_str(&mut h, event_id);
    hex::encode(&h.finalize().as_bytes()[..ID_BYTES])
}

/// ID of the reading for `subject` over `window`.
///
/// SHA-256 of `subject|unit,unit,..|start|end|aggregation` with units sorted
/// and the window bounds in UTC RFC3339.
pub fn reading_id<'a, I>(
    subject: &str,
    units: I,
    window: &TimeWindow,
    aggregation: Aggregation,
) -> String
where
    I: IntoIterator<Item = &'a Unit>,
{
    let mut units: Vec<&str> = units.into_iter().map(Unit::as_str).collect();
    units.sort_unstable();
    units.dedup();

    let material = format!(
        "{}|{}|{}|{}|{}",
        subject,
        units.join(","),
        window.start().to_rfc3339(),
        window.end().to_rfc3339(),
        aggregation.as_str(),
    );

    let digest = Sha256::digest(material.as_bytes());
    hex::encode(&digest[..ID_BYTES])
}
