//! Client tags written on every entry order.
//!
//! Format: `{prefix}-{SYMBOL}-{model}-{nonce}`, at most 32 characters. The tag is
//! the only link between a broker position and the leg that opened it, so the
//! parser never fails loudly: anything it cannot read is an unmanaged position.

use serde::{Deserialize, Serialize};

use super::{canonical_symbol, LegKey, OpenPositionLeg, SignalModel};

/// Broker-side limit on client extension length.
pub const MAX_TAG_LEN: usize = 32;

/// Parsed contents of a client tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTag {
    pub prefix: String,
    pub symbol: String,
    pub model: SignalModel,
}

impl ClientTag {
    pub fn new(prefix: &str, symbol: &str, model: SignalModel) -> Self {
        Self {
            prefix: prefix.trim().to_lowercase(),
            symbol: canonical_symbol(symbol),
            model,
        }
    }

    /// Render with a random nonce so repeated entries stay distinguishable.
    pub fn render(&self) -> String {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        self.render_with_nonce(&nonce[..8])
    }

    pub fn render_with_nonce(&self, nonce: &str) -> String {
        let raw = format!("{}-{}-{}-{}", self.prefix, self.symbol, self.model, nonce);
        raw.chars().take(MAX_TAG_LEN).collect()
    }

    /// Parse a tag, returning `None` for anything not written with `expected_prefix`.
    pub fn parse(raw: &str, expected_prefix: &str) -> Option<Self> {
        let mut parts = raw.trim().split('-');
        let prefix = parts.next()?.to_lowercase();
        if prefix.is_empty() || prefix != expected_prefix.trim().to_lowercase() {
            return None;
        }
        let symbol = parts.next()?.trim().to_uppercase();
        if symbol.is_empty() {
            return None;
        }
        let model = parts.next()?.parse::<SignalModel>().ok()?;
        Some(Self {
            prefix,
            symbol,
            model,
        })
    }
}

/// An open position whose tag identifies it as one of ours.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedLeg {
    pub key: LegKey,
    pub position: OpenPositionLeg,
}

impl ManagedLeg {
    /// Recover `{symbol, model, direction}` from a broker position.
    pub fn from_position(position: &OpenPositionLeg, prefix: &str) -> Option<Self> {
        if !position.is_open() {
            return None;
        }
        let tag = ClientTag::parse(position.tag.as_deref()?, prefix)?;
        let direction = position.direction();
        if !direction.is_directional() {
            return None;
        }
        Some(Self {
            key: LegKey::new(&tag.symbol, tag.model, direction),
            position: position.clone(),
        })
    }
}
