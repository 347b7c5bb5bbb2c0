use crate::error::{Error, Result};

use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::time::Duration;

/// Parsed `spec.schedule`: standard cron (5-field, seconds filled in),
/// `@yearly`…`@hourly` shortcuts, or `@every <duration>`.
#[derive(Clone, Debug)]
pub enum SyncSchedule {
    Cron(Box<cron::Schedule>),
    Every(Duration),
}

impl SyncSchedule {
    pub fn parse(input: &str) -> Result<SyncSchedule> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::ScheduleError("schedule is empty".to_string()));
        }

        if let Some(duration) = input.strip_prefix("@every ") {
            let duration = humantime::parse_duration(duration.trim()).map_err(|e| {
                Error::ScheduleError(format!("invalid @every duration {duration:?}: {e}"))
            })?;
            if duration.is_zero() {
                return Err(Error::ScheduleError("@every duration must be positive".into()));
            }
            return Ok(SyncSchedule::Every(duration));
        }

        // the cron crate wants a seconds field; a standard 5-field
        // expression gets one prepended
        let expression = if !input.starts_with('@') && input.split_whitespace().count() == 5 {
            format!("0 {input}")
        } else {
            input.to_string()
        };
        let schedule = cron::Schedule::from_str(&expression)
            .map_err(|e| Error::ScheduleError(format!("invalid schedule {input:?}: {e}")))?;
        Ok(SyncSchedule::Cron(Box::new(schedule)))
    }

    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            SyncSchedule::Cron(schedule) => schedule.after(&after).next(),
            SyncSchedule::Every(duration) => {
                Some(after + ChronoDuration::from_std(*duration).ok()?)
            }
        }
    }

    /// When to sync next: the requeue delta and the absolute instant. A
    /// next time already in the past collapses to "now".
    pub fn next_sync(
        &self,
        now: DateTime<Utc>,
        last_sync: Option<DateTime<Utc>>,
    ) -> (Duration, DateTime<Utc>) {
        let base = last_sync.unwrap_or(now);
        let next = self.next_after(base).unwrap_or(now);
        if next <= now {
            return (Duration::ZERO, now);
        }
        let delta = (next - now).to_std().unwrap_or(Duration::ZERO);
        (delta, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_duration() {
        let schedule = SyncSchedule::parse("@every 24h").unwrap();
        let now = Utc::now();
        let last = now - ChronoDuration::hours(1);

        let (delta, next) = schedule.next_sync(now, Some(last));
        let expected = last + ChronoDuration::hours(24);
        assert_eq!(next, expected);
        let expected_delta = (expected - now).to_std().unwrap();
        assert!(delta <= expected_delta && delta >= expected_delta - Duration::from_secs(1));
    }

    #[test]
    fn test_overdue_sync_collapses_to_now() {
        let schedule = SyncSchedule::parse("@every 1h").unwrap();
        let now = Utc::now();
        let last = now - ChronoDuration::hours(3);
        let (delta, next) = schedule.next_sync(now, Some(last));
        assert_eq!(delta, Duration::ZERO);
        assert_eq!(next, now);
    }

    #[test]
    fn test_no_last_sync_schedules_from_now() {
        let schedule = SyncSchedule::parse("@every 10m").unwrap();
        let now = Utc::now();
        let (delta, next) = schedule.next_sync(now, None);
        assert!(delta > Duration::from_secs(9 * 60));
        assert!(next > now);
    }

    #[test]
    fn test_five_field_cron_and_shortcuts() {
        assert!(SyncSchedule::parse("0 3 * * *").is_ok());
        assert!(SyncSchedule::parse("@hourly").is_ok());
        assert!(SyncSchedule::parse("@daily").is_ok());
    }

    #[test]
    fn test_cron_next_is_in_the_future() {
        let schedule = SyncSchedule::parse("@hourly").unwrap();
        let now = Utc::now();
        let (_, next) = schedule.next_sync(now, Some(now));
        assert!(next > now);
        assert!(next - now <= ChronoDuration::hours(1));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            SyncSchedule::parse("garbage"),
            Err(Error::ScheduleError(_))
        ));
        assert!(matches!(
            SyncSchedule::parse("@every soon"),
            Err(Error::ScheduleError(_))
        ));
        assert!(matches!(SyncSchedule::parse(""), Err(Error::ScheduleError(_))));
    }
}
