//! Trading logic: alignment, sizing, trailing lock, weekly cycle, reconciliation.

mod alignment;
mod config;
mod position_sizer;
mod reconcile;
mod state_machine;
mod trailing;
mod week;

pub use config::{AccountConfig, EngineConfig, SizingRegime};
pub use reconcile::{ReconcileOptions, Reconciler, DEFAULT_REPORT_LIMIT};
pub use state_machine::{TickOutcome, WeeklyStateMachine};
pub use week::SystemClock;
#[cfg(test)]
pub use week::FixedClock;
