//! Decides whether independent signal models agree enough to trade a basket.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use super::config::{AlignmentMode, BasketDefinition};
use crate::models::{canonical_symbol, BasketSignal, Direction, SignalModel};

/// Outcome of an alignment check. Rejections always carry a reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentResult {
    pub ok: bool,
    pub direction: Option<Direction>,
    pub reason: Option<String>,
}

impl AlignmentResult {
    pub fn accepted(direction: Direction) -> Self {
        Self {
            ok: true,
            direction: Some(direction),
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            direction: None,
            reason: Some(reason.into()),
        }
    }
}

/// Checks a signal set against a basket definition.
#[derive(Debug, Clone)]
pub struct SignalAligner {
    symbols: Vec<String>,
    models: Vec<SignalModel>,
    mode: AlignmentMode,
}

impl SignalAligner {
    pub fn new(basket: &BasketDefinition) -> Self {
        Self {
            symbols: basket.symbols.iter().map(|s| canonical_symbol(s)).collect(),
            models: basket.models.clone(),
            mode: basket.alignment,
        }
    }

    pub fn align(&self, signals: &[BasketSignal]) -> AlignmentResult {
        match self.mode {
            AlignmentMode::Unanimous => self.align_unanimous(signals),
            AlignmentMode::Independent => self.align_independent(signals),
        }
    }

    /// Whether a signal belongs to this basket at all.
    pub fn in_basket(&self, signal: &BasketSignal) -> bool {
        self.models.contains(&signal.model)
            && (self.symbols.is_empty() || self.symbols.contains(&canonical_symbol(&signal.symbol)))
    }

    /// Every required model on every basket symbol must vote the same direction.
    /// An empty symbol list means every symbol the required models signal.
    fn align_unanimous(&self, signals: &[BasketSignal]) -> AlignmentResult {
        let symbols: Vec<String> = if self.symbols.is_empty() {
            signals
                .iter()
                .filter(|s| self.models.contains(&s.model))
                .map(|s| canonical_symbol(&s.symbol))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        } else {
            self.symbols.clone()
        };

        let mut by_symbol: HashMap<String, HashMap<SignalModel, Direction>> = HashMap::new();
        for signal in signals {
            let symbol = canonical_symbol(&signal.symbol);
            if !symbols.contains(&symbol) {
                continue;
            }
            by_symbol
                .entry(symbol)
                .or_default()
                .insert(signal.model, signal.direction);
        }

        let mut direction: Option<Direction> = None;
        for symbol in &symbols {
            let Some(votes) = by_symbol.get(symbol) else {
                return AlignmentResult::rejected(format!("{} missing signals", symbol));
            };
            for model in &self.models {
                let vote = match votes.get(model) {
                    None => {
                        return AlignmentResult::rejected(format!("{} {} missing", symbol, model))
                    }
                    Some(Direction::Neutral) => {
                        return AlignmentResult::rejected(format!("{} {} neutral", symbol, model))
                    }
                    Some(vote) => *vote,
                };
                match direction {
                    None => direction = Some(vote),
                    Some(agreed) if agreed != vote => {
                        return AlignmentResult::rejected(format!("{} {} mismatch", symbol, model))
                    }
                    Some(_) => {}
                }
            }
        }

        match direction {
            Some(direction) => AlignmentResult::accepted(direction),
            None => AlignmentResult::rejected("No aligned direction"),
        }
    }

    /// Every directional vote is traded as its own leg. The reported direction
    /// is the basket's net lean, LONG on a tie.
    fn align_independent(&self, signals: &[BasketSignal]) -> AlignmentResult {
        let net: i32 = signals
            .iter()
            .filter(|s| self.in_basket(s) && s.direction.is_directional())
            .map(|s| s.direction.sign())
            .sum();
        let legs = signals
            .iter()
            .filter(|s| self.in_basket(s) && s.direction.is_directional())
            .count();

        if legs == 0 {
            return AlignmentResult::rejected("No directional legs");
        }
        let direction = if net < 0 {
            Direction::Short
        } else {
            Direction::Long
        };
        AlignmentResult::accepted(direction)
    }
}
