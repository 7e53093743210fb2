//! Occupancy-driven device automation.
//!
//! Every tick the scheduler reads each automated device's room occupancy and
//! feeds two independent debounce timers: one for the enable condition
//! (`count >= persons_before_enabled`) and one for the disable condition
//! (`count <= persons_before_disabled`). A device flips only once its
//! condition has held for the configured delay. Counts strictly between the
//! two thresholds run neither timer and leave the device as it is.

mod debounce;
mod scheduler;

pub use debounce::{DebounceState, DebounceTimer};
pub use scheduler::{
    AutomationScheduler, OccupancySource, SchedulerHandle, TickReport, DEFAULT_TICK_INTERVAL,
};
