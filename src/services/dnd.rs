use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;

use crate::db::models::{AlertPriority, DndOverride, DndSchedule, UserDndSettings};

/// Decide whether a notification to this user should be suppressed at
/// `at`. Weekly slots are evaluated in the DND schedule's timezone,
/// falling back to the user's timezone; absolute override windows are
/// compared in UTC. A P1 alert passes through when `allow_p1_override`
/// is set, for both slots and overrides.
pub fn is_suppressed(
    settings: &UserDndSettings,
    priority: AlertPriority,
    at: DateTime<Utc>,
    user_timezone: &str,
) -> bool {
    if !settings.enabled {
        return false;
    }

    let p1_bypass = priority == AlertPriority::P1 && settings.allow_p1_override;

    if in_override_window(&settings.parsed_overrides(), at) {
        return !p1_bypass;
    }

    let schedule = match settings.parsed_schedule() {
        Some(s) => s,
        // A malformed schedule blob never blocks notifications.
        None => {
            tracing::warn!("User {} has malformed DND schedule", settings.user_id);
            return false;
        }
    };

    if in_weekly_slot(&schedule, at, user_timezone) {
        return !p1_bypass;
    }

    false
}

fn in_override_window(overrides: &[DndOverride], at: DateTime<Utc>) -> bool {
    overrides.iter().any(|o| o.start <= at && at < o.end)
}

fn in_weekly_slot(schedule: &DndSchedule, at: DateTime<Utc>, user_timezone: &str) -> bool {
    let tz_name = schedule.timezone.as_deref().unwrap_or(user_timezone);
    let tz: Tz = match tz_name.parse() {
        Ok(tz) => tz,
        Err(_) => {
            tracing::warn!("Invalid DND timezone {:?}", tz_name);
            return false;
        }
    };

    let local = at.with_timezone(&tz);
    let weekday = local.weekday().num_days_from_sunday() as u8;
    let time = NaiveTime::from_hms_opt(local.hour(), local.minute(), local.second())
        .unwrap_or_default();

    schedule.slots.iter().any(|slot| {
        let (start, end) = match (parse_hhmm(&slot.start), parse_hhmm(&slot.end)) {
            (Some(s), Some(e)) => (s, e),
            _ => return false,
        };

        if start <= end {
            slot.day == weekday && start <= time && time < end
        } else {
            // Crossing midnight splits into [start, 24:00) on the slot's
            // day and [00:00, end) on the following day.
            let next_day = (slot.day + 1) % 7;
            (slot.day == weekday && time >= start) || (next_day == weekday && time < end)
        }
    })
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::DndSlot;
    use serde_json::json;

    fn settings(enabled: bool, allow_p1: bool, schedule: DndSchedule, overrides: Vec<DndOverride>) -> UserDndSettings {
        UserDndSettings {
            user_id: "user".to_string(),
            enabled,
            schedule: serde_json::to_string(&schedule).unwrap(),
            overrides: serde_json::to_string(&overrides).unwrap(),
            allow_p1_override: allow_p1,
            updated_at: Utc::now(),
        }
    }

    fn weeknights_new_york() -> DndSchedule {
        // Mon-Fri 22:00-08:00 local, crossing midnight.
        DndSchedule {
            timezone: Some("America/New_York".to_string()),
            slots: (1..=5)
                .map(|day| DndSlot {
                    day,
                    start: "22:00".to_string(),
                    end: "08:00".to_string(),
                })
                .collect(),
        }
    }

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn disabled_settings_never_suppress() {
        let s = settings(false, false, weeknights_new_york(), vec![]);
        assert!(!is_suppressed(&s, AlertPriority::P3, at("2024-06-04T07:00:00Z"), "UTC"));
    }

    #[test]
    fn p3_suppressed_at_night_p1_passes_with_override_flag() {
        let s = settings(true, true, weeknights_new_york(), vec![]);
        // 2024-06-04T03:00-04:00 = 03:00 EDT Tuesday, inside Mon 22:00-08:00
        // via the cross-midnight half.
        let t = at("2024-06-04T07:00:00Z");

        assert!(is_suppressed(&s, AlertPriority::P3, t, "UTC"));
        assert!(!is_suppressed(&s, AlertPriority::P1, t, "UTC"));
    }

    #[test]
    fn p1_without_override_flag_is_suppressed_like_any_other() {
        let s = settings(true, false, weeknights_new_york(), vec![]);
        let t = at("2024-06-04T07:00:00Z");

        assert!(is_suppressed(&s, AlertPriority::P1, t, "UTC"));
    }

    #[test]
    fn daytime_is_not_suppressed() {
        let s = settings(true, false, weeknights_new_york(), vec![]);
        // 12:00 EDT Tuesday.
        assert!(!is_suppressed(&s, AlertPriority::P3, at("2024-06-04T16:00:00Z"), "UTC"));
    }

    #[test]
    fn slot_end_is_exclusive() {
        let s = settings(true, false, weeknights_new_york(), vec![]);
        // Exactly 08:00 EDT Tuesday: the window has ended.
        assert!(!is_suppressed(&s, AlertPriority::P3, at("2024-06-04T12:00:00Z"), "UTC"));
        // 07:59 EDT is still inside.
        assert!(is_suppressed(&s, AlertPriority::P3, at("2024-06-04T11:59:00Z"), "UTC"));
    }

    #[test]
    fn override_window_suppresses_regardless_of_slots() {
        let overrides = vec![DndOverride {
            start: at("2024-06-10T00:00:00Z"),
            end: at("2024-06-17T00:00:00Z"),
            reason: Some("vacation".to_string()),
        }];
        let s = settings(true, false, DndSchedule::default(), overrides);

        assert!(is_suppressed(&s, AlertPriority::P2, at("2024-06-12T15:00:00Z"), "UTC"));
        assert!(!is_suppressed(&s, AlertPriority::P2, at("2024-06-17T00:00:00Z"), "UTC"));
    }

    #[test]
    fn p1_bypasses_override_window_when_allowed() {
        let overrides = vec![DndOverride {
            start: at("2024-06-10T00:00:00Z"),
            end: at("2024-06-17T00:00:00Z"),
            reason: None,
        }];
        let s = settings(true, true, DndSchedule::default(), overrides);

        assert!(!is_suppressed(&s, AlertPriority::P1, at("2024-06-12T15:00:00Z"), "UTC"));
        assert!(is_suppressed(&s, AlertPriority::P2, at("2024-06-12T15:00:00Z"), "UTC"));
    }

    #[test]
    fn schedule_timezone_falls_back_to_user_timezone() {
        let schedule = DndSchedule {
            timezone: None,
            slots: vec![DndSlot {
                day: 2, // Tuesday
                start: "00:00".to_string(),
                end: "06:00".to_string(),
            }],
        };
        let s = settings(true, false, schedule, vec![]);

        // 03:00 EDT Tuesday = 07:00 UTC; suppressed only if the user's
        // timezone is applied.
        let t = at("2024-06-04T07:00:00Z");
        assert!(is_suppressed(&s, AlertPriority::P3, t, "America/New_York"));
        assert!(!is_suppressed(&s, AlertPriority::P3, t, "UTC"));
    }

    #[test]
    fn malformed_schedule_blob_does_not_block() {
        let s = UserDndSettings {
            user_id: "user".to_string(),
            enabled: true,
            schedule: "][ not json".to_string(),
            overrides: json!([]).to_string(),
            allow_p1_override: false,
            updated_at: Utc::now(),
        };

        assert!(!is_suppressed(&s, AlertPriority::P3, at("2024-06-04T07:00:00Z"), "UTC"));
    }
}
