//! Typed condition-set management, built directly on
//! `k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition` rather than a
//! bespoke enum, since every status struct in `auth-operator-types` already
//! stores `Vec<Condition>` verbatim.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use std::fmt;

/// Condition `type` strings used across the three reconcilers. `Ready` and
/// `Stalled` are the two kstatus-style summary conditions every status
/// block carries; the rest are per-step diagnostics.
pub mod types {
    pub const READY: &str = "Ready";
    pub const STALLED: &str = "Stalled";
    pub const RECONCILING: &str = "Reconciling";
    pub const API_DISCOVERY: &str = "APIDiscovery";
    pub const RESOURCE_FILTERED: &str = "ResourceFiltered";
    pub const ROLE_REF_VALID: &str = "RoleRefValid";
    pub const OWNER_REF: &str = "OwnerRef";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    True,
    False,
    Unknown,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::True => write!(f, "True"),
            Status::False => write!(f, "False"),
            Status::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Builds (or updates) a single condition inside `conditions`, keyed by
/// `type`. `last_transition_time` only advances when `status` actually
/// changes from what was previously recorded, so repeated `set` calls with
/// an unchanged status are no-ops on that field.
pub fn set(
    conditions: &mut Vec<Condition>,
    generation: i64,
    type_: &str,
    status: Status,
    reason: &str,
    message: impl Into<String>,
) {
    let now = Time(chrono::Utc::now());
    let message = message.into();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        let changed = existing.status != status.to_string();
        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message;
        existing.observed_generation = Some(generation);
        if changed {
            existing.last_transition_time = now;
        }
        return;
    }

    conditions.push(Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message,
        observed_generation: Some(generation),
        last_transition_time: now,
    });
}

pub fn get<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    get(conditions, type_).is_some_and(|c| c.status == "True")
}

/// Convenience used by every reconciler's success path: mark the object
/// Ready and clear any lingering Stalled condition from a prior failed
/// generation.
pub fn mark_ready(conditions: &mut Vec<Condition>, generation: i64, message: impl Into<String>) {
    set(
        conditions,
        generation,
        types::READY,
        Status::True,
        "ReconcileSucceeded",
        message,
    );
    set(
        conditions,
        generation,
        types::STALLED,
        Status::False,
        "ReconcileSucceeded",
        "",
    );
    set(
        conditions,
        generation,
        types::RECONCILING,
        Status::False,
        "ReconcileSucceeded",
        "",
    );
}

/// Marks the object Stalled with the given reason/message and Ready=False,
/// used for permanent user errors the controller will not retry on its own.
pub fn mark_stalled(
    conditions: &mut Vec<Condition>,
    generation: i64,
    reason: &str,
    message: impl Into<String>,
) {
    let message = message.into();
    set(
        conditions,
        generation,
        types::STALLED,
        Status::True,
        reason,
        message.clone(),
    );
    set(
        conditions,
        generation,
        types::READY,
        Status::False,
        reason,
        message,
    );
    set(
        conditions,
        generation,
        types::RECONCILING,
        Status::False,
        reason,
        "",
    );
}

/// Marks the object as actively reconciling but not yet settled -- used
/// while a transient error is being retried, so Ready stays False without
/// flipping Stalled.
pub fn mark_reconciling(
    conditions: &mut Vec<Condition>,
    generation: i64,
    reason: &str,
    message: impl Into<String>,
) {
    let message = message.into();
    set(
        conditions,
        generation,
        types::RECONCILING,
        Status::True,
        reason,
        message.clone(),
    );
    set(
        conditions,
        generation,
        types::READY,
        Status::False,
        reason,
        message,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_inserts_a_new_condition_with_transition_time() {
        let mut conditions = Vec::new();
        set(
            &mut conditions,
            1,
            types::READY,
            Status::True,
            "Done",
            "all good",
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "True");
        assert_eq!(conditions[0].observed_generation, Some(1));
    }

    #[test]
    fn set_does_not_bump_transition_time_when_status_is_unchanged() {
        let mut conditions = Vec::new();
        set(&mut conditions, 1, types::READY, Status::True, "Done", "a");
        let first_time = conditions[0].last_transition_time.clone();
        set(&mut conditions, 2, types::READY, Status::True, "Done", "b");
        assert_eq!(conditions[0].last_transition_time, first_time);
        assert_eq!(conditions[0].observed_generation, Some(2));
        assert_eq!(conditions[0].message, "b");
    }

    #[test]
    fn set_bumps_transition_time_when_status_flips() {
        let mut conditions = Vec::new();
        set(&mut conditions, 1, types::READY, Status::True, "Done", "a");
        let first_time = conditions[0].last_transition_time.clone();
        set(
            &mut conditions,
            2,
            types::READY,
            Status::False,
            "Broken",
            "b",
        );
        assert_ne!(conditions[0].last_transition_time, first_time);
    }

    #[test]
    fn mark_ready_clears_stalled() {
        let mut conditions = Vec::new();
        mark_stalled(&mut conditions, 1, "BadRef", "missing role");
        assert!(!is_true(&conditions, types::READY));
        mark_ready(&mut conditions, 2, "fixed");
        assert!(is_true(&conditions, types::READY));
        assert!(!is_true(&conditions, types::STALLED));
    }
}
