//! `beacon-scheduler`: per-widget execution scheduling.
//!
//! # Overview
//!
//! Every widget instance gets its own timer, armed through the
//! [`ExecutionRegistry`]. When a timer fires, [`WidgetScheduler`] re-reads the
//! instance, decrypts its secret parameters, runs the script in the sandbox,
//! records the outcome and notifies viewers, then re-arms the next tick.
//!
//! # State machine
//!
//! | From              | Event                         | To       |
//! |-------------------|-------------------------------|----------|
//! | STOPPED           | `schedule_widget`             | RUNNING  |
//! | SUCCESS / WARNING | next tick starts              | RUNNING  |
//! | RUNNING           | success                       | SUCCESS  |
//! | RUNNING           | CONTINUE failure              | WARNING  |
//! | RUNNING           | FATAL failure or cancellation | STOPPED  |
//!
//! Results from a run whose epoch was superseded are dropped before they
//! reach the store.

pub mod engine;
pub mod registry;
pub mod schedule;

pub use engine::{Collaborators, WidgetScheduler};
pub use registry::{Epoch, ExecutionRegistry, ExecutionTicket};
pub use schedule::{SchedulePolicy, REFRESH_INTERVAL_PARAM};
