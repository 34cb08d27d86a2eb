use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

/// Set or update a typed condition. The transition time only moves when the
/// status actually flips, so `lastTransitionTime` stays meaningful across
/// repeated reconciles.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    observed_generation: i64,
) {
    let now = Time(Utc::now());
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != status {
                existing.last_transition_time = now;
            }
            existing.status = status.to_string();
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = Some(observed_generation);
        }
        None => conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: Some(observed_generation),
            last_transition_time: now,
        }),
    }
}

pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// A condition recorded against an older generation is informational only.
pub fn is_stale(condition: &Condition, generation: i64) -> bool {
    condition.observed_generation.unwrap_or(0) < generation
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn sets_a_new_condition() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "Installed", "True", "InstallationSucceeded", "ok", 1);
        let cond = find(&conditions, "Installed").unwrap();
        assert_eq!(cond.status, "True");
        assert_eq!(cond.reason, "InstallationSucceeded");
        assert_eq!(cond.observed_generation, Some(1));
    }

    #[test]
    fn transition_time_only_moves_on_status_flips() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "Installed", "False", "InstallFailed", "boom", 1);
        let first = conditions[0].last_transition_time.clone();

        // same status, new message: transition time untouched
        set_condition(&mut conditions, "Installed", "False", "InstallFailed", "boom 2", 2);
        assert_eq!(conditions[0].last_transition_time, first);
        assert_eq!(conditions[0].message, "boom 2");
        assert_eq!(conditions[0].observed_generation, Some(2));

        // flipped status: transition time moves (or at least stays valid)
        set_condition(&mut conditions, "Installed", "True", "InstallationSucceeded", "ok", 3);
        assert_eq!(conditions[0].status, "True");
        assert!(conditions[0].last_transition_time.0 >= first.0);
    }

    #[test]
    fn staleness_is_generation_based() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "Validated", "True", "ValidateSuccessful", "ok", 2);
        let cond = find(&conditions, "Validated").unwrap();
        assert!(is_stale(cond, 3));
        assert!(!is_stale(cond, 2));
    }

    #[test]
    fn conditions_of_different_types_coexist() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "Installed", "True", "InstallationSucceeded", "", 1);
        set_condition(&mut conditions, "Validated", "True", "ValidateSuccessful", "", 1);
        assert_eq!(conditions.len(), 2);
    }
}
