//! Recurring-job schedules
//!
//! Each job carries its own next-run time; the runner polls `due_jobs` on
//! a coarse tick and marks jobs after dispatch. All methods take the clock
//! as an argument so tests can drive time explicitly.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

/// When a job recurs
#[derive(Debug, Clone, Copy)]
pub enum Recurrence {
    EveryMinutes(u32),
    EveryHours(u32),
    /// Daily at a fixed UTC hour, on the hour
    DailyAtHour(u32),
}

impl Recurrence {
    pub fn next_occurrence(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Recurrence::EveryMinutes(m) => from + Duration::minutes(*m as i64),
            Recurrence::EveryHours(h) => from + Duration::hours(*h as i64),
            Recurrence::DailyAtHour(hour) => {
                let time = chrono::NaiveTime::from_hms_opt(*hour % 24, 0, 0)
                    .unwrap_or(chrono::NaiveTime::MIN);
                let today = DateTime::from_naive_utc_and_offset(
                    from.date_naive().and_time(time),
                    Utc,
                );
                if today > from {
                    today
                } else {
                    today + Duration::days(1)
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
struct JobSchedule {
    recurrence: Recurrence,
    next_run: DateTime<Utc>,
    last_run: Option<DateTime<Utc>>,
}

/// Named job schedules with independent next-run times.
#[derive(Default)]
pub struct ScheduleSet {
    jobs: RwLock<BTreeMap<&'static str, JobSchedule>>,
}

impl ScheduleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job. Interval jobs first fire one interval from `now`;
    /// daily jobs fire at their next wall-clock occurrence.
    pub fn add(&self, name: &'static str, recurrence: Recurrence, now: DateTime<Utc>) {
        let schedule =
            JobSchedule { recurrence, next_run: recurrence.next_occurrence(now), last_run: None };
        self.jobs.write().insert(name, schedule);
    }

    /// Names of jobs whose next-run time has passed, in registration-name
    /// order.
    pub fn due_jobs(&self, now: DateTime<Utc>) -> Vec<&'static str> {
        self.jobs
            .read()
            .iter()
            .filter(|(_, job)| now >= job.next_run)
            .map(|(name, _)| *name)
            .collect()
    }

    /// Record a dispatch and roll the job's next-run time forward.
    pub fn mark_run(&self, name: &str, now: DateTime<Utc>) {
        if let Some(job) = self.jobs.write().get_mut(name) {
            job.last_run = Some(now);
            job.next_run = job.recurrence.next_occurrence(now);
        }
    }

    pub fn last_run(&self, name: &str) -> Option<DateTime<Utc>> {
        self.jobs.read().get(name).and_then(|j| j.last_run)
    }

    pub fn next_run(&self, name: &str) -> Option<DateTime<Utc>> {
        self.jobs.read().get(name).map(|j| j.next_run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_interval_recurrence() {
        let from = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        let next = Recurrence::EveryMinutes(5).next_occurrence(from);
        assert_eq!((next - from).num_minutes(), 5);

        let next = Recurrence::EveryHours(1).next_occurrence(from);
        assert_eq!((next - from).num_hours(), 1);
    }

    #[test]
    fn test_daily_recurrence_rolls_past_today() {
        let before = Utc.with_ymd_and_hms(2024, 6, 1, 1, 30, 0).unwrap();
        let next = Recurrence::DailyAtHour(3).next_occurrence(before);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 1, 3, 0, 0).unwrap());

        let after = Utc.with_ymd_and_hms(2024, 6, 1, 5, 0, 0).unwrap();
        let next = Recurrence::DailyAtHour(3).next_occurrence(after);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 2, 3, 0, 0).unwrap());
        assert_eq!(next.hour(), 3);
    }

    #[test]
    fn test_due_and_mark_run() {
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        let set = ScheduleSet::new();
        set.add("refresh", Recurrence::EveryMinutes(5), t0);

        assert!(set.due_jobs(t0).is_empty());
        let t1 = t0 + Duration::minutes(5);
        assert_eq!(set.due_jobs(t1), vec!["refresh"]);

        set.mark_run("refresh", t1);
        assert!(set.due_jobs(t1).is_empty());
        assert_eq!(set.last_run("refresh"), Some(t1));
        assert_eq!(set.due_jobs(t1 + Duration::minutes(5)), vec!["refresh"]);
    }

    #[test]
    fn test_independent_jobs() {
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        let set = ScheduleSet::new();
        set.add("backfill", Recurrence::EveryHours(1), t0);
        set.add("refresh", Recurrence::EveryMinutes(5), t0);

        let due = set.due_jobs(t0 + Duration::minutes(10));
        assert_eq!(due, vec!["refresh"]);

        let due = set.due_jobs(t0 + Duration::hours(2));
        assert_eq!(due, vec!["backfill", "refresh"]);
    }
}
