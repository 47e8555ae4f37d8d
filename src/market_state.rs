// ===============================
// src/market_state.rs
// ===============================
//
// Reconciled market/selection state.
//
// Merge rule (both levels): a field present in the incoming payload overwrites
// the stored value, an absent field keeps whatever we had. Derived flags are
// never stored, they are recomputed from the selection list on every read.
// The only sticky bit is `is_activated`.
//
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{Market, Selection, LINE_TAG, SELECTION_ACTIVE};

/// Incoming field "matches" when it is absent or equal to what is stored.
fn field_matches<T: PartialEq>(incoming: &Option<T>, stored: &Option<T>) -> bool {
    match incoming {
        None => true,
        Some(v) => stored.as_ref() == Some(v),
    }
}

fn overwrite<T: Clone>(stored: &mut Option<T>, incoming: &Option<T>) {
    if let Some(v) = incoming {
        *stored = Some(v.clone());
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SelectionState {
    pub id: String,
    pub name: Option<String>,
    pub price: Option<f64>,
    pub tradable: Option<bool>,
    pub status: Option<String>,
}

impl SelectionState {
    pub fn new(selection: &Selection) -> Self {
        let mut st = SelectionState { id: selection.id.clone(), ..Default::default() };
        st.merge(selection);
        st
    }

    pub fn merge(&mut self, selection: &Selection) {
        overwrite(&mut self.name, &selection.name);
        overwrite(&mut self.price, &selection.price);
        overwrite(&mut self.tradable, &selection.tradable);
        overwrite(&mut self.status, &selection.status);
    }

    /// True if merging `selection` would leave this state untouched.
    pub fn matches(&self, selection: &Selection) -> bool {
        self.id == selection.id
            && field_matches(&selection.name, &self.name)
            && field_matches(&selection.price, &self.price)
            && field_matches(&selection.tradable, &self.tradable)
            && field_matches(&selection.status, &self.status)
    }

    pub fn is_active(&self) -> bool {
        self.status.as_deref() == Some(SELECTION_ACTIVE)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MarketState {
    pub id: String,
    pub name: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub is_pending: bool,
    pub is_resulted: bool,
    is_activated: bool,
    is_force_suspended: bool,
    selections: Vec<SelectionState>,
}

impl MarketState {
    pub fn new(market: &Market) -> Self {
        let mut st = MarketState { id: market.id.clone(), ..Default::default() };
        st.merge(market);
        st
    }

    /// Merge a payload for this market. Returns true when any observable
    /// field changed.
    pub fn merge(&mut self, market: &Market) -> bool {
        let changed = !self.equals(market);

        overwrite(&mut self.name, &market.name);
        if let Some(p) = market.is_pending {
            self.is_pending = p;
        }
        if let Some(r) = market.is_resulted {
            self.is_resulted = r;
        }
        for (k, v) in &market.tags {
            self.tags.insert(k.clone(), v.clone());
        }
        for sel in &market.selections {
            match self.selections.iter_mut().find(|s| s.id == sel.id) {
                Some(st) => st.merge(sel),
                None => self.selections.push(SelectionState::new(sel)),
            }
        }

        if self.is_active() {
            self.is_activated = true;
        }
        changed
    }

    /// Equality of an incoming payload against the stored state: name,
    /// pending, resulted and line, plus every selection in the payload must
    /// already exist here and compare equal. Active/suspended follow from the
    /// selections, so they can only differ when a selection differs.
    pub fn equals(&self, market: &Market) -> bool {
        if market.id != self.id {
            return false;
        }
        let line_matches = match market.line() {
            None => true,
            Some(l) => self.line() == Some(l),
        };
        field_matches(&market.name, &self.name)
            && market.is_pending.map_or(true, |p| p == self.is_pending)
            && market.is_resulted.map_or(true, |r| r == self.is_resulted)
            && line_matches
            && market.selections.iter().all(|sel| {
                self.selection(&sel.id)
                    .map(|st| st.matches(sel))
                    .unwrap_or(false)
            })
    }

    pub fn selection(&self, id: &str) -> Option<&SelectionState> {
        self.selections.iter().find(|s| s.id == id)
    }

    pub fn selections(&self) -> &[SelectionState] {
        &self.selections
    }

    pub fn line(&self) -> Option<&str> {
        self.tags.get(LINE_TAG).map(String::as_str)
    }

    pub fn is_active(&self) -> bool {
        self.selections.iter().any(SelectionState::is_active)
    }

    /// No active selection, or every active selection explicitly untradable.
    pub fn is_suspended(&self) -> bool {
        let mut active = self.selections.iter().filter(|s| s.is_active()).peekable();
        if active.peek().is_none() {
            return true;
        }
        active.all(|s| s.tradable == Some(false))
    }

    pub fn is_activated(&self) -> bool {
        self.is_activated
    }

    pub fn is_force_suspended(&self) -> bool {
        self.is_force_suspended
    }

    pub fn set_force_suspended(&mut self, on: bool) {
        self.is_force_suspended = on;
    }
}
