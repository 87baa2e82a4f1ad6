//! Broker and signal feed clients.

mod paper;
mod signal_client;
mod types;

use anyhow::Result;
use async_trait::async_trait;

pub use paper::PaperBroker;
pub use signal_client::SignalClient;
#[cfg(test)]
pub use signal_client::StaticSignalFeed;
pub use types::*;

use crate::models::{
    AccountSnapshot, MarketSnapshot, OpenPositionLeg, OrderAck, OrderRequest, SignalSnapshot,
};

/// Everything the engine needs from a venue.
#[async_trait]
pub trait Broker: Send + Sync {
    fn name(&self) -> &'static str;

    async fn account(&self) -> Result<AccountSnapshot>;

    /// Specs and quotes for `symbols`. Symbols the venue cannot price are
    /// left out rather than failing the call.
    async fn market(&self, symbols: &[String]) -> Result<MarketSnapshot>;

    async fn open_positions(&self) -> Result<Vec<OpenPositionLeg>>;

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck>;

    async fn close_position(&self, position: &OpenPositionLeg) -> Result<()>;
}

/// Source of the latest weekly signal set.
#[async_trait]
pub trait SignalFeed: Send + Sync {
    async fn latest(&self, asset: &str) -> Result<SignalSnapshot>;
}
