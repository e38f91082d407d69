//! Requester-preference boosts applied after the base ranking.

use ragpipe_shared::{DocumentCandidate, UserPreferences};

pub const CONTENT_TYPE_BOOST: f64 = 1.2;
pub const EXPERTISE_BOOST: f64 = 1.1;

/// Multiplier for `candidate` under `prefs`; 1.0 when nothing matches.
pub fn boost(candidate: &DocumentCandidate, prefs: &UserPreferences) -> f64 {
    let mut factor = 1.0;

    if let Some(content_type) = &candidate.content_type {
        if prefs
            .content_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(content_type))
        {
            factor *= CONTENT_TYPE_BOOST;
        }
    }

    if let (Some(doc), Some(user)) = (candidate.expertise_level, prefs.expertise_level) {
        if (doc.band() - user.band()).abs() <= 1 {
            factor *= EXPERTISE_BOOST;
        }
    }

    factor
}
