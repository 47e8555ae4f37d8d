// ===============================
// src/market_states.rs
// ===============================
//
// Per-fixture collection of MarketState. Owned and mutated by exactly one
// stream listener; anything that wants a stable view asks for `snapshot()`,
// which freezes the current map behind an Arc.
//
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::domain::Fixture;
use crate::market_state::MarketState;

#[derive(Debug, Clone, Default)]
pub struct MarketStateCollection {
    fixture_id: String,
    sport: String,
    markets: BTreeMap<String, MarketState>,
    last_snapshot_sequence: Option<u64>,
}

/// Frozen, cheaply clonable view of a collection.
#[derive(Debug, Clone)]
pub struct MarketStatesSnapshot {
    pub fixture_id: String,
    pub sport: String,
    pub last_snapshot_sequence: Option<u64>,
    markets: Arc<BTreeMap<String, MarketState>>,
}

impl MarketStatesSnapshot {
    pub fn get(&self, market_id: &str) -> Option<&MarketState> {
        self.markets.get(market_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MarketState> {
        self.markets.values()
    }

    pub fn len(&self) -> usize {
        self.markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }
}

impl MarketStateCollection {
    pub fn new(fixture_id: impl Into<String>, sport: impl Into<String>) -> Self {
        Self {
            fixture_id: fixture_id.into(),
            sport: sport.into(),
            ..Default::default()
        }
    }

    /// Merge every market of `fixture` and return the entries whose
    /// observable fields changed (newly seen markets always count).
    pub fn update(&mut self, fixture: &Fixture, is_full_snapshot: bool) -> Vec<MarketState> {
        if !fixture.sport.is_empty() {
            self.sport = fixture.sport.clone();
        }

        let mut changed = Vec::new();
        for market in &fixture.markets {
            let hit = match self.markets.get_mut(&market.id) {
                Some(st) => st.merge(market),
                None => {
                    self.markets.insert(market.id.clone(), MarketState::new(market));
                    true
                }
            };
            if hit {
                if let Some(st) = self.markets.get(&market.id) {
                    changed.push(st.clone());
                }
            }
        }

        if is_full_snapshot {
            // markets missing from a full snapshot are kept as they are
            let missing = self
                .markets
                .keys()
                .filter(|id| !fixture.markets.iter().any(|m| &m.id == *id))
                .count();
            if missing > 0 {
                debug!(fixture_id = %self.fixture_id, missing, "markets absent from snapshot kept");
            }
            self.last_snapshot_sequence = Some(fixture.sequence);
        }

        changed
    }

    /// Administrative override. Returns false for an unknown market.
    pub fn force_suspend(&mut self, market_id: &str) -> bool {
        self.set_force(market_id, true)
    }

    pub fn force_unsuspend(&mut self, market_id: &str) -> bool {
        self.set_force(market_id, false)
    }

    /// Returns the ids whose override flag actually flipped.
    pub fn force_suspend_all(&mut self) -> Vec<String> {
        self.set_force_all(true)
    }

    pub fn force_unsuspend_all(&mut self) -> Vec<String> {
        self.set_force_all(false)
    }

    fn set_force(&mut self, market_id: &str, on: bool) -> bool {
        match self.markets.get_mut(market_id) {
            Some(st) => {
                st.set_force_suspended(on);
                true
            }
            None => false,
        }
    }

    fn set_force_all(&mut self, on: bool) -> Vec<String> {
        let mut flipped = Vec::new();
        for (id, st) in self.markets.iter_mut() {
            if st.is_force_suspended() != on {
                st.set_force_suspended(on);
                flipped.push(id.clone());
            }
        }
        flipped
    }

    pub fn get(&self, market_id: &str) -> Option<&MarketState> {
        self.markets.get(market_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MarketState> {
        self.markets.values()
    }

    pub fn len(&self) -> usize {
        self.markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }

    /// Markets suspended either by data or by override.
    pub fn suspended_count(&self) -> usize {
        self.markets
            .values()
            .filter(|m| m.is_suspended() || m.is_force_suspended())
            .count()
    }

    pub fn last_snapshot_sequence(&self) -> Option<u64> {
        self.last_snapshot_sequence
    }

    pub fn clear(&mut self) {
        self.markets.clear();
        self.last_snapshot_sequence = None;
    }

    pub fn snapshot(&self) -> MarketStatesSnapshot {
        MarketStatesSnapshot {
            fixture_id: self.fixture_id.clone(),
            sport: self.sport.clone(),
            last_snapshot_sequence: self.last_snapshot_sequence,
            markets: Arc::new(self.markets.clone()),
        }
    }
}
