//! Periodic triggers

mod cron;
mod runner;

pub use cron::{Recurrence, ScheduleSet};
pub use runner::JobRunner;
