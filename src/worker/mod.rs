//! Poll scheduling.
//!
//! - `scheduler` — Idle → Running → Stopped state machine, poll passes and poll tasks
//! - `guard` — per-account in-flight set so one account is never polled twice at once

pub mod guard;
pub mod scheduler;

pub use guard::{InFlight, InFlightGuard};
pub use scheduler::{PollReport, PollResult, Scheduler, SchedulerState};
