// ===============================
// src/overview.rs
// ===============================
//
// Read-only rollups owned by the supervisor. Listeners send a
// FixtureStateSummary; the supervisor turns it into a FixtureOverview and
// rebuilds the SportOverview of that sport from all fixtures it knows.
//
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::MatchStatus;
use crate::listener::ListenerState;

/// What a listener reports after every accepted payload / state change.
#[derive(Debug, Clone, PartialEq)]
pub struct FixtureStateSummary {
    pub fixture_id: String,
    pub sport: String,
    pub description: Option<String>,
    pub competition_id: Option<String>,
    pub competition_name: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub sequence: u64,
    pub epoch: u64,
    pub match_status: Option<MatchStatus>,
    pub listener_state: ListenerState,
    pub is_streaming: bool,
    pub is_errored: bool,
    pub is_suspended: bool,
    pub is_deleted: bool,
    pub is_over: bool,
    pub last_exception: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureOverview {
    pub id: String,
    pub sport: String,
    pub description: Option<String>,
    pub competition_id: Option<String>,
    pub competition_name: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub sequence: u64,
    pub epoch: u64,
    pub match_status: Option<MatchStatus>,
    pub listener_state: ListenerState,
    pub is_streaming: bool,
    pub is_in_error_state: bool,
    pub is_suspended: bool,
    pub is_deleted: bool,
    pub is_over: bool,
    pub last_exception: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl FixtureOverview {
    pub fn from_summary(s: &FixtureStateSummary, now: DateTime<Utc>) -> Self {
        Self {
            id: s.fixture_id.clone(),
            sport: s.sport.clone(),
            description: s.description.clone(),
            competition_id: s.competition_id.clone(),
            competition_name: s.competition_name.clone(),
            start_time: s.start_time,
            sequence: s.sequence,
            epoch: s.epoch,
            match_status: s.match_status,
            listener_state: s.listener_state,
            is_streaming: s.is_streaming,
            is_in_error_state: s.is_errored,
            is_suspended: s.is_suspended,
            is_deleted: s.is_deleted,
            is_over: s.is_over,
            last_exception: s.last_exception.clone(),
            last_updated: now,
        }
    }

    /// Equality ignoring `last_updated`.
    pub fn same_content(&self, other: &FixtureOverview) -> bool {
        let aligned = FixtureOverview { last_updated: other.last_updated, ..self.clone() };
        aligned == *other
    }

    /// Deleted or finished fixtures drop out of sport counts.
    pub fn is_retired(&self) -> bool {
        self.is_deleted || self.is_over
    }

    pub fn name(&self) -> &str {
        self.description.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SportOverview {
    pub name: String,
    pub total: usize,
    pub in_error: usize,
    pub in_play: usize,
    pub in_pre_match: usize,
    pub in_setup: usize,
}

impl SportOverview {
    pub fn from_fixtures<'a>(name: &str, fixtures: impl IntoIterator<Item = &'a FixtureOverview>) -> Self {
        let mut o = SportOverview {
            name: name.to_string(),
            total: 0,
            in_error: 0,
            in_play: 0,
            in_pre_match: 0,
            in_setup: 0,
        };
        for f in fixtures.into_iter().filter(|f| f.sport == name && !f.is_retired()) {
            o.total += 1;
            if f.is_in_error_state {
                o.in_error += 1;
            }
            // belum ada status = masih setup
            let status = f.match_status.unwrap_or_default();
            if status.is_in_play() {
                o.in_play += 1;
            } else if status.is_pre_match() {
                o.in_pre_match += 1;
            } else if status.is_setup() {
                o.in_setup += 1;
            }
        }
        o
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SportDetail {
    pub overview: SportOverview,
    pub fixtures: Vec<FixtureOverview>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    pub epoch: u64,
    pub match_status: Option<MatchStatus>,
    pub listener_state: ListenerState,
    pub is_in_error_state: bool,
    pub last_exception: Option<String>,
}

impl From<&FixtureOverview> for FixtureHistoryEntry {
    fn from(f: &FixtureOverview) -> Self {
        Self {
            timestamp: f.last_updated,
            sequence: f.sequence,
            epoch: f.epoch,
            match_status: f.match_status,
            listener_state: f.listener_state,
            is_in_error_state: f.is_in_error_state,
            last_exception: f.last_exception.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureDetail {
    pub overview: FixtureOverview,
    pub history: Vec<FixtureHistoryEntry>,
    pub has_listener: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterStatus {
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub listener_count: usize,
    pub fixture_count: usize,
    pub sport_count: usize,
    pub fixtures_in_error: usize,
    pub messages_processed: u64,
    pub sport_pushes: u64,
    pub fixture_pushes: u64,
}

/// Everything that can be handed to push subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Overview {
    Sport(SportOverview),
    Fixture(FixtureOverview),
    Detail(FixtureDetail),
}

impl Overview {
    pub fn key(&self) -> &str {
        match self {
            Overview::Sport(s) => &s.name,
            Overview::Fixture(f) => &f.id,
            Overview::Detail(d) => &d.overview.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Overview::Sport(s) => &s.name,
            Overview::Fixture(f) => f.name(),
            Overview::Detail(d) => d.overview.name(),
        }
    }

    /// Sport rollups are recomputed on demand and carry no timestamp.
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        match self {
            Overview::Sport(_) => None,
            Overview::Fixture(f) => Some(f.last_updated),
            Overview::Detail(d) => Some(d.overview.last_updated),
        }
    }
}
