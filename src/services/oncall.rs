use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use sqlx::SqlitePool;

use crate::db::models::{
    RotationParticipant, RotationType, Schedule, ScheduleOverride, ScheduleRotation,
};
use crate::db::repository::ScheduleRepository;
use crate::error::{AppError, AppResult};

/// Who is on call at an instant, and whether an override put them there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnCall {
    pub user_id: String,
    pub is_override: bool,
}

/// Resolve the on-call user for a schedule at `at`.
///
/// Overrides win outright. Otherwise the first rotation (by creation)
/// applies: the participant index is the number of elapsed handoffs
/// modulo the participant count. All handoff arithmetic is wall-clock in
/// the schedule's IANA timezone, so DST transitions compress or extend a
/// shift rather than drifting the handoff time. Deterministic for a given
/// input; never consults the local clock.
pub fn resolve(
    schedule: &Schedule,
    rotations: &[ScheduleRotation],
    participants: &[RotationParticipant],
    overrides: &[ScheduleOverride],
    at: DateTime<Utc>,
) -> Option<OnCall> {
    for o in overrides {
        if o.start_at <= at && at < o.end_at {
            return Some(OnCall {
                user_id: o.user_id.clone(),
                is_override: true,
            });
        }
    }

    let rotation = rotations.first()?;
    if participants.is_empty() {
        return None;
    }

    let tz: Tz = match schedule.timezone.parse() {
        Ok(tz) => tz,
        Err(_) => {
            tracing::warn!(
                "Schedule {} has invalid timezone {:?}",
                schedule.id,
                schedule.timezone
            );
            return None;
        }
    };

    let at_local = at.with_timezone(&tz).naive_local();
    let start_local = rotation.start_date.and_time(rotation.start_time);
    if at_local < start_local {
        return None;
    }

    let elapsed = elapsed_handoffs(rotation, at_local)?;
    let index = (elapsed % participants.len() as i64) as usize;

    participants
        .iter()
        .find(|p| p.position == index as i64)
        .map(|p| OnCall {
            user_id: p.user_id.clone(),
            is_override: false,
        })
}

/// Number of handoffs that have occurred at or before `at_local`.
///
/// Handoff instants form a wall-clock pattern anchored at the rotation
/// start: every `rotation_length` days (daily/custom) at `handoff_time`,
/// or every `rotation_length` weeks on `handoff_day` (weekly). The
/// anchor occurrence itself starts participant 0's cycle and is not
/// counted as a handoff.
fn elapsed_handoffs(rotation: &ScheduleRotation, at_local: NaiveDateTime) -> Option<i64> {
    let rotation_type = RotationType::parse(&rotation.rotation_type)?;
    let length = rotation.rotation_length.max(1);

    let (anchor_date, period_days) = match rotation_type {
        RotationType::Daily | RotationType::Custom => (rotation.start_date, length),
        RotationType::Weekly => {
            let handoff_day = rotation.handoff_day.unwrap_or(0).rem_euclid(7) as u32;
            (
                first_weekday_on_or_after(rotation.start_date, handoff_day),
                length * 7,
            )
        }
    };

    let days = (at_local.date() - anchor_date).num_days();
    if days < 0 {
        return Some(0);
    }

    let mut n = days / period_days;
    let candidate = anchor_date + Duration::days(n * period_days);
    if at_local < candidate.and_time(rotation.handoff_time) {
        n -= 1;
    }

    Some(n.max(0))
}

/// First date on or after `from` whose weekday is `day` (0=Sunday..6=Saturday).
fn first_weekday_on_or_after(from: NaiveDate, day: u32) -> NaiveDate {
    let current = from.weekday().num_days_from_sunday();
    let ahead = (day + 7 - current) % 7;
    from + Duration::days(ahead as i64)
}

/// Store-backed wrapper used by the escalation scheduler and the API.
pub struct OnCallResolver;

impl OnCallResolver {
    pub async fn who_is_on_call(
        pool: &SqlitePool,
        schedule_id: &str,
        at: DateTime<Utc>,
    ) -> AppResult<Option<OnCall>> {
        let schedule = ScheduleRepository::find_by_id(pool, schedule_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("schedule {schedule_id}")))?;

        let overrides = ScheduleRepository::overrides_at(pool, schedule_id, at).await?;
        let rotations = ScheduleRepository::rotations(pool, schedule_id).await?;

        let participants = match rotations.first() {
            Some(rotation) => ScheduleRepository::participants(pool, &rotation.id).await?,
            None => Vec::new(),
        };

        Ok(resolve(&schedule, &rotations, &participants, &overrides, at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn schedule(tz: &str) -> Schedule {
        let now = Utc::now();
        Schedule {
            id: "sched".to_string(),
            organization_id: "org".to_string(),
            name: "primary".to_string(),
            timezone: tz.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    fn weekly_rotation(start: NaiveDate, handoff_day: i64, handoff: &str) -> ScheduleRotation {
        ScheduleRotation {
            id: "rot".to_string(),
            schedule_id: "sched".to_string(),
            rotation_type: "weekly".to_string(),
            rotation_length: 1,
            start_date: start,
            start_time: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            handoff_day: Some(handoff_day),
            handoff_time: handoff.parse().unwrap(),
            created_at: Utc::now(),
        }
    }

    fn daily_rotation(start: NaiveDate, length: i64, handoff: &str) -> ScheduleRotation {
        ScheduleRotation {
            id: "rot".to_string(),
            schedule_id: "sched".to_string(),
            rotation_type: "daily".to_string(),
            rotation_length: length,
            start_date: start,
            start_time: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            handoff_day: None,
            handoff_time: handoff.parse().unwrap(),
            created_at: Utc::now(),
        }
    }

    fn participants(names: &[&str]) -> Vec<RotationParticipant> {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| RotationParticipant {
                rotation_id: "rot".to_string(),
                user_id: n.to_string(),
                position: i as i64,
            })
            .collect()
    }

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn weekly_handoff_monday_morning_new_york() {
        let schedule = schedule("America/New_York");
        let rotation = weekly_rotation("2024-01-01".parse().unwrap(), 1, "09:00:00");
        let people = participants(&["alice", "bob", "carol"]);

        // Mon Jan 8 13:59 UTC = 08:59 local, still before the 09:00 handoff.
        let r = resolve(&schedule, &[rotation.clone()], &people, &[], at("2024-01-08T13:59:00Z"));
        assert_eq!(r.unwrap().user_id, "alice");

        // 14:01 UTC = 09:01 local, past the handoff.
        let r = resolve(&schedule, &[rotation.clone()], &people, &[], at("2024-01-08T14:01:00Z"));
        assert_eq!(r.unwrap().user_id, "bob");

        // One week later: carol.
        let r = resolve(&schedule, &[rotation.clone()], &people, &[], at("2024-01-15T14:01:00Z"));
        assert_eq!(r.unwrap().user_id, "carol");

        // And the cycle wraps back to alice.
        let r = resolve(&schedule, &[rotation], &people, &[], at("2024-01-22T14:01:00Z"));
        assert_eq!(r.unwrap().user_id, "alice");
    }

    #[test]
    fn before_rotation_start_returns_none() {
        let schedule = schedule("UTC");
        let rotation = daily_rotation("2024-06-01".parse().unwrap(), 1, "09:00:00");
        let people = participants(&["alice", "bob"]);

        let r = resolve(&schedule, &[rotation], &people, &[], at("2024-05-31T23:59:00Z"));
        assert!(r.is_none());
    }

    #[test]
    fn daily_rotation_cycles_in_order() {
        let schedule = schedule("UTC");
        let rotation = daily_rotation("2024-06-01".parse().unwrap(), 1, "09:00:00");
        let people = participants(&["alice", "bob", "carol"]);

        // Strict cycling through positions over consecutive days.
        for (day, expected) in [
            ("2024-06-01T10:00:00Z", "alice"),
            ("2024-06-02T10:00:00Z", "bob"),
            ("2024-06-03T10:00:00Z", "carol"),
            ("2024-06-04T10:00:00Z", "alice"),
        ] {
            let r = resolve(&schedule, &[rotation.clone()], &people, &[], at(day));
            assert_eq!(r.unwrap().user_id, expected, "at {day}");
        }

        // Just before the daily handoff the previous participant holds.
        let r = resolve(&schedule, &[rotation], &people, &[], at("2024-06-02T08:59:00Z"));
        assert_eq!(r.unwrap().user_id, "alice");
    }

    #[test]
    fn multi_day_custom_length() {
        let schedule = schedule("UTC");
        let rotation = daily_rotation("2024-06-01".parse().unwrap(), 3, "00:00:00");
        let people = participants(&["alice", "bob"]);

        let r = resolve(&schedule, &[rotation.clone()], &people, &[], at("2024-06-03T12:00:00Z"));
        assert_eq!(r.unwrap().user_id, "alice");

        let r = resolve(&schedule, &[rotation], &people, &[], at("2024-06-04T12:00:00Z"));
        assert_eq!(r.unwrap().user_id, "bob");
    }

    #[test]
    fn override_wins_within_window_only() {
        let schedule = schedule("UTC");
        let rotation = daily_rotation("2024-06-01".parse().unwrap(), 1, "09:00:00");
        let people = participants(&["alice", "bob"]);
        let overrides = vec![ScheduleOverride {
            id: "ov".to_string(),
            schedule_id: "sched".to_string(),
            user_id: "dave".to_string(),
            start_at: at("2024-06-01T12:00:00Z"),
            end_at: at("2024-06-01T18:00:00Z"),
            created_at: Utc::now(),
        }];

        let r = resolve(&schedule, &[rotation.clone()], &people, &overrides, at("2024-06-01T13:00:00Z"));
        let r = r.unwrap();
        assert_eq!(r.user_id, "dave");
        assert!(r.is_override);

        // End is exclusive.
        let r = resolve(&schedule, &[rotation], &people, &overrides, at("2024-06-01T18:00:00Z"));
        let r = r.unwrap();
        assert_eq!(r.user_id, "alice");
        assert!(!r.is_override);
    }

    #[test]
    fn spring_forward_compresses_shift_but_keeps_wall_clock_handoff() {
        // US DST began 2024-03-10 02:00 local. Handoffs stay at 09:00
        // wall clock; EST 09:00 = 14:00 UTC, EDT 09:00 = 13:00 UTC.
        let schedule = schedule("America/New_York");
        let rotation = weekly_rotation("2024-03-04".parse().unwrap(), 1, "09:00:00");
        let people = participants(&["alice", "bob"]);

        // Mon Mar 11 13:30 UTC = 09:30 EDT: past the handoff.
        let r = resolve(&schedule, &[rotation.clone()], &people, &[], at("2024-03-11T13:30:00Z"));
        assert_eq!(r.unwrap().user_id, "bob");

        // Mon Mar 11 12:30 UTC = 08:30 EDT: still alice. Under the old
        // offset 12:30 UTC would have read 07:30; either way pre-handoff.
        let r = resolve(&schedule, &[rotation], &people, &[], at("2024-03-11T12:30:00Z"));
        assert_eq!(r.unwrap().user_id, "alice");
    }

    #[test]
    fn fall_back_extends_shift_by_an_hour() {
        // US DST ended 2024-11-03 02:00 local. EDT 09:00 = 13:00 UTC,
        // EST 09:00 = 14:00 UTC, so the Nov 4 handoff lands an absolute
        // hour later than a naive +1 week would.
        let schedule = schedule("America/New_York");
        let rotation = weekly_rotation("2024-10-28".parse().unwrap(), 1, "09:00:00");
        let people = participants(&["alice", "bob"]);

        // Mon Nov 4 13:30 UTC = 08:30 EST: alice's shift got the extra hour.
        let r = resolve(&schedule, &[rotation.clone()], &people, &[], at("2024-11-04T13:30:00Z"));
        assert_eq!(r.unwrap().user_id, "alice");

        // Mon Nov 4 14:30 UTC = 09:30 EST: handoff has happened.
        let r = resolve(&schedule, &[rotation], &people, &[], at("2024-11-04T14:30:00Z"));
        assert_eq!(r.unwrap().user_id, "bob");
    }

    #[test]
    fn resolution_is_repeatable() {
        let schedule = schedule("America/New_York");
        let rotation = weekly_rotation("2024-01-01".parse().unwrap(), 1, "09:00:00");
        let people = participants(&["alice", "bob", "carol"]);
        let t = at("2024-02-20T03:00:00Z");

        let first = resolve(&schedule, &[rotation.clone()], &people, &[], t);
        for _ in 0..10 {
            let again = resolve(&schedule, &[rotation.clone()], &people, &[], t);
            assert_eq!(again, first);
        }
    }

    #[test]
    fn empty_participants_resolve_to_none() {
        let schedule = schedule("UTC");
        let rotation = daily_rotation("2024-06-01".parse().unwrap(), 1, "09:00:00");

        let r = resolve(&schedule, &[rotation], &[], &[], at("2024-06-02T10:00:00Z"));
        assert!(r.is_none());
    }
}
