//! Recurring jobs: crontab parsing, schedule matching and the scheduler loop.

pub mod crontab;
pub mod schedule;
pub mod scheduler;

pub use crontab::{load_crontab_file, parse_crontab, parse_fill_period, CronItem, CronItemOptions};
pub use schedule::Schedule;
pub use scheduler::{CronConfig, CronHandle, CronScheduler, CronState};
