// ===============================
// src/domain.rs
// ===============================
//
// Value types as received from the feed. These are transient: every snapshot
// or update carries a fresh Fixture, and the reconciled view lives in
// MarketState / SelectionState (see market_state.rs).
//
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Selection status codes as carried on the wire.
pub const SELECTION_ACTIVE: &str = "1";
pub const SELECTION_INACTIVE: &str = "0";

/// Tag key holding the handicap line of a market.
pub const LINE_TAG: &str = "line";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MatchStatus {
    #[default]
    Setup,
    Ready,
    PreMatch,
    InRunning,
    MatchOverUnConfirmed,
    MatchOver,
    Abandoned,
    Deleted,
}

impl MatchStatus {
    pub fn is_setup(&self) -> bool {
        matches!(self, MatchStatus::Setup)
    }

    /// Ready and PreMatch are both "before the off".
    pub fn is_pre_match(&self) -> bool {
        matches!(self, MatchStatus::Ready | MatchStatus::PreMatch)
    }

    pub fn is_in_play(&self) -> bool {
        matches!(self, MatchStatus::InRunning | MatchStatus::MatchOverUnConfirmed)
    }

    pub fn is_over(&self) -> bool {
        matches!(self, MatchStatus::MatchOver | MatchStatus::Abandoned)
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, MatchStatus::Deleted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Setup => "setup",
            MatchStatus::Ready => "ready",
            MatchStatus::PreMatch => "pre_match",
            MatchStatus::InRunning => "in_running",
            MatchStatus::MatchOverUnConfirmed => "match_over_unconfirmed",
            MatchStatus::MatchOver => "match_over",
            MatchStatus::Abandoned => "abandoned",
            MatchStatus::Deleted => "deleted",
        }
    }
}

/// Why the feed bumped a fixture's epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EpochChangeReason {
    Created,
    Deleted,
    StartTime,
    MatchStatus,
    Participants,
    Definition,
    BaseVariables,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Selection {
    pub id: String,
    pub name: Option<String>,
    pub price: Option<f64>,
    pub tradable: Option<bool>,
    pub status: Option<String>,
}

impl Selection {
    pub fn is_active(&self) -> bool {
        self.status.as_deref() == Some(SELECTION_ACTIVE)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub is_pending: Option<bool>,
    pub is_resulted: Option<bool>,
    #[serde(default)]
    pub selections: Vec<Selection>,
}

impl Market {
    pub fn line(&self) -> Option<&str> {
        self.tags.get(LINE_TAG).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Fixture {
    pub id: String,
    #[serde(default)]
    pub sport: String,
    pub competition_id: Option<String>,
    pub competition_name: Option<String>,
    pub description: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub sequence: u64,
    pub epoch: u64,
    #[serde(default)]
    pub last_epoch_change_reasons: Vec<EpochChangeReason>,
    pub match_status: Option<MatchStatus>,
    #[serde(default)]
    pub markets: Vec<Market>,
}

impl Fixture {
    pub fn is_deleted(&self) -> bool {
        self.match_status.map(|s| s.is_deleted()).unwrap_or(false)
            || self
                .last_epoch_change_reasons
                .contains(&EpochChangeReason::Deleted)
    }

    pub fn is_match_over(&self) -> bool {
        self.match_status.map(|s| s.is_over()).unwrap_or(false)
    }

    pub fn is_match_status_changed(&self) -> bool {
        self.last_epoch_change_reasons
            .contains(&EpochChangeReason::MatchStatus)
    }

    /// Copy of the fixture header without markets.
    pub fn header(&self) -> Fixture {
        Fixture { markets: Vec::new(), ..self.clone() }
    }
}

/// Reason a fixture is suspended towards the plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuspensionReason {
    HealthCheckFailure,
    Disconnected,
    FixtureErrored,
    FixtureDeleted,
    SnapshotFailure,
    Administrative,
    Disposing,
}

impl SuspensionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuspensionReason::HealthCheckFailure => "health_check_failure",
            SuspensionReason::Disconnected => "disconnected",
            SuspensionReason::FixtureErrored => "fixture_errored",
            SuspensionReason::FixtureDeleted => "fixture_deleted",
            SuspensionReason::SnapshotFailure => "snapshot_failure",
            SuspensionReason::Administrative => "administrative",
            SuspensionReason::Disposing => "disposing",
        }
    }
}

// Records written by the JSONL recorder
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Snapshot { ts_ns: i128, fixture: Fixture, epoch_changed: bool },
    Delta { ts_ns: i128, fixture: Fixture, epoch_changed: bool },
    MatchStatus { ts_ns: i128, fixture_id: String, status: Option<MatchStatus> },
    Deletion { ts_ns: i128, fixture_id: String },
    Suspend { ts_ns: i128, fixture_id: String, reason: SuspensionReason },
    UnSuspend { ts_ns: i128, fixture_id: String },
}

pub fn now_ns() -> i128 {
    Utc::now().timestamp_nanos_opt().unwrap_or(0) as i128
}
