//! Severity aggregation: triage fields (and optionally vocal emotion) to one score in [0, 5].

use crate::triage::fields::TriageFields;

pub const EVENT_WEIGHT: f64 = 0.30;
pub const VICTIMS_WEIGHT: f64 = 0.15;
pub const WEAPON_WEIGHT: f64 = 0.10;
pub const INJURY_WEIGHT: f64 = 0.35;
pub const THREAT_WEIGHT: f64 = 0.10;

pub const MAX_SCORE: f64 = 5.0;

/// Victim count on the 0 to 5 rank scale.
pub fn victims_bucket(victims: u32) -> u8 {
    match victims {
        0 => 0,
        1 => 1,
        2..=3 => 2,
        4..=5 => 3,
        6..=10 => 4,
        _ => 5,
    }
}

/// Weighted sum of the categorical ranks, rounded to 2 decimals.
pub fn context_score(fields: &TriageFields) -> f64 {
    let threat = if fields.ongoing_threat.is_ongoing() { 5.0 } else { 0.0 };
    round2(
        EVENT_WEIGHT * fields.event.rank() as f64
            + VICTIMS_WEIGHT * victims_bucket(fields.victims) as f64
            + WEAPON_WEIGHT * fields.weapon.rank() as f64
            + INJURY_WEIGHT * fields.injuries.rank() as f64
            + THREAT_WEIGHT * threat,
    )
}

/// Final score. `emotion_weight` of 0.0 (or no emotion) yields the context score.
pub fn score(fields: &TriageFields, emotion: Option<f64>, emotion_weight: f64) -> f64 {
    let context = context_score(fields);
    let blended = match emotion {
        Some(emotion) if emotion_weight > 0.0 => {
            let w = emotion_weight.clamp(0.0, 1.0);
            round2((1.0 - w) * context + w * emotion)
        }
        _ => context,
    };
    blended.clamp(0.0, MAX_SCORE)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
