use std::time::Duration;

mod fair;
mod list;

pub use fair::{
    FairScheduler, RateBudget, ReadReadiness, SchedConnection, SchedulerConfig,
};
pub use list::{ConnKey, ConnectionList, Entry};

/// How long a connection may report "not ready" before it is demoted from the
/// per-tick active list to the low-frequency idle list.
pub const IDLE_THRESHOLD: Duration = Duration::from_millis(500);

/// Minimum interval between two sweeps of the idle list looking for
/// connections whose traffic has resumed.
pub const IDLE_SWEEP_INTERVAL: Duration = Duration::from_millis(500);
