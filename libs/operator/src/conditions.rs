use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub const TYPE_READY: &str = "Ready";
pub const TYPE_SYNCED: &str = "Synced";
pub const TYPE_SCHEDULED: &str = "Scheduled";
pub const TYPE_NOTIFICATIONS_HEALTHY: &str = "NotificationsHealthy";

pub const STATUS_TRUE: &str = "True";
pub const STATUS_FALSE: &str = "False";

/// Build a condition with `lastTransitionTime = now`.
pub fn new_condition(
    type_: &str,
    status: bool,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: if status { STATUS_TRUE } else { STATUS_FALSE }.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Time(Utc::now()),
        observed_generation,
    }
}

/// Replace the condition of the same type, preserving `lastTransitionTime`
/// when the status did not actually transition.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            let last_transition_time = if existing.status == condition.status {
                existing.last_transition_time.clone()
            } else {
                condition.last_transition_time.clone()
            };
            *existing = Condition {
                last_transition_time,
                ..condition
            };
        }
        None => conditions.push(condition),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_replaces_same_type() {
        let mut conditions = vec![new_condition(TYPE_READY, false, "Init", "", None)];
        set_condition(
            &mut conditions,
            new_condition(TYPE_READY, true, "EngineRunning", "", Some(2)),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, STATUS_TRUE);
        assert_eq!(conditions[0].reason, "EngineRunning");
        assert_eq!(conditions[0].observed_generation, Some(2));
    }

    #[test]
    fn test_set_condition_preserves_transition_time_without_transition() {
        let first = new_condition(TYPE_READY, true, "EngineRunning", "", None);
        let original_time = first.last_transition_time.clone();
        let mut conditions = vec![first];
        set_condition(
            &mut conditions,
            new_condition(TYPE_READY, true, "EngineRunning", "still fine", None),
        );
        assert_eq!(conditions[0].last_transition_time, original_time);
        assert_eq!(conditions[0].message, "still fine");
    }

    #[test]
    fn test_set_condition_appends_new_type() {
        let mut conditions = vec![new_condition(TYPE_READY, true, "EngineRunning", "", None)];
        set_condition(
            &mut conditions,
            new_condition(TYPE_NOTIFICATIONS_HEALTHY, false, "SlackFailed", "500", None),
        );
        assert_eq!(conditions.len(), 2);
    }
}
