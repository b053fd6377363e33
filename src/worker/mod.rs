//! Background loops.
//!
//! Core components:
//! - `initiation` — first contact for `NEW` clients
//! - `timeout_sweep` — reminders once a requested pause has elapsed
//! - `orchestrator` — cycles initiation, inbox drains and the sweep on a timer

pub mod initiation;
pub mod orchestrator;
pub mod timeout_sweep;

pub use initiation::OutreachInitiation;
pub use orchestrator::{CycleReport, Orchestrator, spawn_orchestrator};
pub use timeout_sweep::TimeoutSweep;
