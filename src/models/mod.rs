//! Data models for signals, planned legs, broker snapshots and persisted state.

mod broker;
mod plan;
mod signal;
mod state;
mod tag;

pub use broker::{
    AccountSnapshot, InstrumentSpec, MarketSnapshot, OpenPositionLeg, OrderAck, OrderRequest,
    Quote,
};
pub(crate) use broker::finite_positive;
pub use plan::{group_signals, LegKey, PlannedLeg, PlannedPair};
pub use signal::{canonical_symbol, AssetClass, BasketSignal, Direction, SignalModel, SignalSnapshot};
pub use state::{AccountState, EntrySnapshot};
pub use tag::{ClientTag, ManagedLeg};
