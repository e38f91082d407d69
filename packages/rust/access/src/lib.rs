//! Permission-aware candidate filtering (RBAC + ABAC).
//!
//! A candidate is visible to a requester when *any* grant holds:
//! 1. the requester id is on the candidate's access-control list,
//! 2. requester roles intersect the candidate's required roles,
//! 3. departments match,
//! 4. the candidate's project is in the requester's project access,
//! 5. the requester's clearance rank is at least the candidate's classification rank,
//! 6. any ABAC attribute key/value pair matches.
//!
//! A requester listed in `revoked_users` is denied before any grant is
//! considered. Evaluation is pure and synchronous: no I/O, no allocation
//! beyond the decision itself.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::trace;

use ragpipe_shared::{DocumentCandidate, PermissionMetadata, UserContext};

// ---------------------------------------------------------------------------
// Clearance
// ---------------------------------------------------------------------------

/// Fixed total order over classification levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Clearance {
    Public = 0,
    Internal = 1,
    Confidential = 2,
    Secret = 3,
    TopSecret = 4,
}

impl Clearance {
    /// Lenient parse: case-insensitive, accepts `top_secret`, `top-secret`, `topsecret`.
    pub fn parse(value: &str) -> Option<Self> {
        let normalized: String = value
            .trim()
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .flat_map(char::to_lowercase)
            .collect();
        match normalized.as_str() {
            "public" => Some(Self::Public),
            "internal" => Some(Self::Internal),
            "confidential" => Some(Self::Confidential),
            "secret" => Some(Self::Secret),
            "topsecret" => Some(Self::TopSecret),
            _ => None,
        }
    }

    pub fn rank(&self) -> u8 {
        *self as u8
    }
}

/// Rank of a candidate's classification. Absent means `internal`; an
/// unrecognised label is treated as `top_secret`.
pub fn classification_rank(classification: Option<&str>) -> u8 {
    match classification {
        None => Clearance::Internal.rank(),
        Some(label) => Clearance::parse(label)
            .unwrap_or(Clearance::TopSecret)
            .rank(),
    }
}

/// Rank of a requester's clearance; `None` when absent or unrecognised.
pub fn clearance_rank(clearance: Option<&str>) -> Option<u8> {
    clearance.and_then(Clearance::parse).map(|c| c.rank())
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Why access was granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grant {
    AccessList,
    Role,
    Department,
    Project,
    Clearance,
    Attribute,
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum AccessDecision {
    Granted(Grant),
    Revoked,
    NoGrant,
}

impl AccessDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

impl fmt::Display for AccessDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Granted(grant) => write!(f, "granted ({grant:?})"),
            Self::Revoked => f.write_str("denied (revoked)"),
            Self::NoGrant => f.write_str("denied (no grant)"),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate access, returning the first matching grant in rule order.
pub fn evaluate(meta: &PermissionMetadata, user: &UserContext) -> AccessDecision {
    if meta.revoked_users.iter().any(|u| *u == user.id) {
        return AccessDecision::Revoked;
    }

    if meta.access_control_list.iter().any(|u| *u == user.id) {
        return AccessDecision::Granted(Grant::AccessList);
    }

    if meta
        .required_roles
        .iter()
        .any(|role| user.roles.iter().any(|r| r == role))
    {
        return AccessDecision::Granted(Grant::Role);
    }

    if let (Some(doc_dept), Some(user_dept)) = (&meta.department, &user.department) {
        if doc_dept == user_dept {
            return AccessDecision::Granted(Grant::Department);
        }
    }

    if let Some(project) = &meta.project_id {
        if user.project_access.iter().any(|p| p == project) {
            return AccessDecision::Granted(Grant::Project);
        }
    }

    if let Some(user_rank) = clearance_rank(user.clearance_level.as_deref()) {
        if user_rank >= classification_rank(meta.classification.as_deref()) {
            return AccessDecision::Granted(Grant::Clearance);
        }
    }

    if meta
        .attributes
        .iter()
        .any(|(key, value)| user.attributes.get(key) == Some(value))
    {
        return AccessDecision::Granted(Grant::Attribute);
    }

    AccessDecision::NoGrant
}

/// Whether `user` may see a candidate carrying `meta`.
pub fn is_accessible(meta: &PermissionMetadata, user: &UserContext) -> bool {
    evaluate(meta, user).is_granted()
}

/// Keep only the candidates `user` may see, preserving order.
pub fn filter_accessible(
    candidates: Vec<DocumentCandidate>,
    user: &UserContext,
) -> (Vec<DocumentCandidate>, usize) {
    let before = candidates.len();
    let kept: Vec<DocumentCandidate> = candidates
        .into_iter()
        .filter(|c| {
            let decision = evaluate(&c.permissions, user);
            trace!(candidate = %c.id, user = %user.id, %decision, "permission check");
            decision.is_granted()
        })
        .collect();
    let denied = before - kept.len();
    (kept, denied)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn user() -> UserContext {
        UserContext::new("alice")
    }

    fn locked_down() -> PermissionMetadata {
        PermissionMetadata {
            classification: Some("top_secret".into()),
            ..Default::default()
        }
    }

    #[test]
    fn access_list_grants() {
        let mut meta = locked_down();
        meta.access_control_list = vec!["bob".into(), "alice".into()];
        assert_eq!(evaluate(&meta, &user()), AccessDecision::Granted(Grant::AccessList));
    }

    #[test]
    fn role_intersection_grants() {
        let mut meta = locked_down();
        meta.required_roles = vec!["admin".into(), "analyst".into()];
        let mut u = user();
        u.roles = vec!["analyst".into()];
        assert_eq!(evaluate(&meta, &u), AccessDecision::Granted(Grant::Role));
    }

    #[test]
    fn department_match_grants() {
        let mut meta = locked_down();
        meta.department = Some("finance".into());
        let mut u = user();
        u.department = Some("finance".into());
        assert!(is_accessible(&meta, &u));
        u.department = Some("legal".into());
        assert!(!is_accessible(&meta, &u));
    }

    #[test]
    fn project_access_grants() {
        let mut meta = locked_down();
        meta.project_id = Some("apollo".into());
        let mut u = user();
        u.project_access = vec!["gemini".into(), "apollo".into()];
        assert_eq!(evaluate(&meta, &u), AccessDecision::Granted(Grant::Project));
    }

    #[test]
    fn clearance_hierarchy() {
        let mut u = user();
        u.clearance_level = Some("secret".into());

        for (label, expected) in [
            ("public", true),
            ("internal", true),
            ("confidential", true),
            ("secret", true),
            ("top_secret", false),
        ] {
            let meta = PermissionMetadata {
                classification: Some(label.into()),
                ..Default::default()
            };
            assert_eq!(is_accessible(&meta, &u), expected, "classification {label}");
        }
    }

    #[test]
    fn confidential_hidden_from_internal_clearance() {
        let meta = PermissionMetadata {
            classification: Some("confidential".into()),
            ..Default::default()
        };
        let mut u = user();
        u.clearance_level = Some("internal".into());
        assert_eq!(evaluate(&meta, &u), AccessDecision::NoGrant);
    }

    #[test]
    fn missing_classification_defaults_to_internal() {
        let meta = PermissionMetadata::default();
        let mut u = user();
        u.clearance_level = Some("public".into());
        assert!(!is_accessible(&meta, &u));
        u.clearance_level = Some("Internal".into());
        assert!(is_accessible(&meta, &u));
    }

    #[test]
    fn unknown_labels_fail_closed() {
        let meta = PermissionMetadata {
            classification: Some("ultra".into()),
            ..Default::default()
        };
        let mut u = user();
        u.clearance_level = Some("top-secret".into());
        assert!(is_accessible(&meta, &u));
        u.clearance_level = Some("secret".into());
        assert!(!is_accessible(&meta, &u));

        // Unknown requester clearance never grants.
        let public = PermissionMetadata {
            classification: Some("public".into()),
            ..Default::default()
        };
        u.clearance_level = Some("galactic".into());
        assert!(!is_accessible(&public, &u));
    }

    #[test]
    fn no_clearance_means_no_clearance_grant() {
        let meta = PermissionMetadata {
            classification: Some("public".into()),
            ..Default::default()
        };
        assert_eq!(evaluate(&meta, &user()), AccessDecision::NoGrant);
    }

    #[test]
    fn attribute_match_grants() {
        let mut meta = locked_down();
        meta.attributes.insert("region".into(), json!("emea"));
        meta.attributes.insert("tier".into(), json!(2));

        let mut u = user();
        u.attributes.insert("region".into(), json!("apac"));
        assert!(!is_accessible(&meta, &u));

        u.attributes.insert("tier".into(), json!(2));
        assert_eq!(evaluate(&meta, &u), AccessDecision::Granted(Grant::Attribute));
    }

    #[test]
    fn revocation_overrides_every_grant() {
        let mut meta = PermissionMetadata {
            classification: Some("public".into()),
            access_control_list: vec!["alice".into()],
            ..Default::default()
        };
        meta.revoked_users = vec!["alice".into()];
        let mut u = user();
        u.clearance_level = Some("top_secret".into());
        assert_eq!(evaluate(&meta, &u), AccessDecision::Revoked);
    }

    #[test]
    fn filter_preserves_order_and_counts_denials() {
        let mut u = user();
        u.clearance_level = Some("internal".into());

        let make = |id: &str, class: &str| DocumentCandidate {
            id: id.into(),
            permissions: PermissionMetadata {
                classification: Some(class.into()),
                ..Default::default()
            },
            ..Default::default()
        };

        let (kept, denied) = filter_accessible(
            vec![
                make("a", "public"),
                make("b", "secret"),
                make("c", "internal"),
                make("d", "confidential"),
            ],
            &u,
        );
        let ids: Vec<&str> = kept.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(denied, 2);
    }

    #[test]
    fn decision_serializes_with_reason() {
        let json = serde_json::to_string(&AccessDecision::Granted(Grant::Role)).unwrap();
        assert_eq!(json, r#"{"decision":"granted","reason":"role"}"#);
    }
}
