// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : odds_feed_rust — per-fixture odds stream reconciliation in Rust
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Listens to per-fixture odds streams, validates sequence/epoch
          ordering, reconciles market/selection state, forwards real changes
          to a plugin, and aggregates sport/fixture overviews for push
          subscribers.
=============================================================================
*/
use std::env;
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;
use rand::Rng;

/// Command line; everything else comes from the environment / .env
#[derive(Debug, Clone, Parser)]
#[command(name = "odds_feed_rust", about = "Per-fixture odds stream adapter")]
pub struct Cli {
    /// Alternate env file loaded before reading configuration.
    #[arg(long)]
    pub env_file: Option<String>,

    /// Overrides FIXTURES, e.g. "Football:F1,Tennis:F2".
    #[arg(long)]
    pub fixtures: Option<String>,
}

/// Sumber data fixture
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedMode {
    Mock,
    Remote,
}

impl FeedMode {
    pub fn from_env(key: &str, default_mode: FeedMode) -> FeedMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "mock" => FeedMode::Mock,
            "remote" => FeedMode::Remote,
            _ => default_mode,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Mock => "mock",
            FeedMode::Remote => "remote",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FixtureSpec {
    pub sport: String,
    pub id: String,
}

impl FixtureSpec {
    /// "Football:F1,Tennis:F2" -> specs. Entries without a sport land in "Unknown".
    pub fn parse_list(s: &str) -> Vec<FixtureSpec> {
        let mut out: Vec<FixtureSpec> = s
            .split(',')
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(|t| match t.split_once(':') {
                Some((sport, id)) => FixtureSpec { sport: sport.trim().into(), id: id.trim().into() },
                None => FixtureSpec { sport: "Unknown".into(), id: t.into() },
            })
            .filter(|f| !f.id.is_empty())
            .collect();
        let mut seen = std::collections::HashSet::new();
        out.retain(|f| seen.insert(f.id.clone()));
        out
    }
}

/// Exponential backoff + jitter for reconnects.
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter_ms: 250,
        }
    }
}

impl BackoffPolicy {
    /// attempt 0 -> base, doubling up to `max`, plus 0..=jitter_ms.
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.min(16);
        let factor = 1u32 << shift;
        let raw = self.base.saturating_mul(factor).min(self.max);
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        raw + Duration::from_millis(jitter)
    }
}

#[derive(Clone, Debug)]
pub struct ListenerConfig {
    /// No accepted update for this long while upstream moved on = stale.
    pub staleness: Duration,
    pub health_check_interval: Duration,
    /// Consecutive ordering rejections tolerated before Errored.
    pub max_sequence_rejections: u32,
    pub reconnect: BackoffPolicy,
    /// Failed reconnects before escalating to Errored.
    pub max_reconnect_attempts: u32,
    pub diagnostics_interval: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            staleness: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(10),
            max_sequence_rejections: 3,
            reconnect: BackoffPolicy::default(),
            max_reconnect_attempts: 5,
            diagnostics_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub persist_interval: Duration,
    pub diagnostics_interval: Duration,
    /// History entries kept per fixture.
    pub history_len: usize,
    pub state_key: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            persist_interval: Duration::from_secs(30),
            diagnostics_interval: Duration::from_secs(60),
            history_len: 50,
            state_key: "fixture_overviews".into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Args {
    pub fixtures: Vec<FixtureSpec>,

    // feed
    pub feed_mode: FeedMode,
    pub rest_url: String,
    pub ws_url: String,
    pub api_token: Option<String>,

    // files/metrics
    pub store_dir: String,
    pub record_file: Option<String>,
    pub metrics_port: u16,

    pub listener: ListenerConfig,
    pub supervisor: SupervisorConfig,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

pub fn load(cli: &Cli) -> Args {
    // Pastikan .env dibaca
    match &cli.env_file {
        Some(path) => {
            if let Err(e) = dotenvy::from_filename(path) {
                tracing::warn!(?e, %path, "env file not loaded");
            }
        }
        None => {
            let _ = dotenv();
        }
    }

    // FIXTURES=Football:F1,Tennis:F2
    let fixture_list = cli
        .fixtures
        .clone()
        .or_else(|| env::var("FIXTURES").ok())
        .unwrap_or_else(|| "Football:mock-1,Tennis:mock-2".to_string());
    let fixtures = FixtureSpec::parse_list(&fixture_list);

    let feed_mode = FeedMode::from_env("FEED_MODE", FeedMode::Mock);
    let rest_url = env::var("FEED_REST_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());
    let ws_url = env::var("FEED_WS_URL").unwrap_or_else(|_| "ws://localhost:8080/ws".to_string());
    let api_token = env::var("FEED_API_TOKEN").ok().filter(|t| !t.is_empty());

    let store_dir = env::var("STORE_DIR").unwrap_or_else(|_| "./state".to_string());
    let record_file = env::var("RECORD_FILE").ok();
    let metrics_port = env_parse("METRICS_PORT", 9898);

    let ld = ListenerConfig::default();
    let listener = ListenerConfig {
        staleness: env_secs("STALENESS_SECS", ld.staleness),
        health_check_interval: env_secs("HEALTH_CHECK_SECS", ld.health_check_interval),
        max_sequence_rejections: env_parse("MAX_SEQUENCE_REJECTIONS", ld.max_sequence_rejections),
        reconnect: BackoffPolicy {
            base: env_millis("RECONNECT_BASE_MS", ld.reconnect.base),
            max: env_millis("RECONNECT_MAX_MS", ld.reconnect.max),
            jitter_ms: env_parse("RECONNECT_JITTER_MS", ld.reconnect.jitter_ms),
        },
        max_reconnect_attempts: env_parse("MAX_RECONNECT_ATTEMPTS", ld.max_reconnect_attempts),
        diagnostics_interval: env_secs("LISTENER_DIAGNOSTICS_SECS", ld.diagnostics_interval),
    };

    let sd = SupervisorConfig::default();
    let supervisor = SupervisorConfig {
        persist_interval: env_secs("PERSIST_SECS", sd.persist_interval),
        diagnostics_interval: env_secs("SUPERVISOR_DIAGNOSTICS_SECS", sd.diagnostics_interval),
        history_len: env_parse("HISTORY_LEN", sd.history_len),
        state_key: env::var("STATE_KEY").unwrap_or(sd.state_key),
    };

    Args {
        fixtures,
        feed_mode,
        rest_url,
        ws_url,
        api_token,
        store_dir,
        record_file,
        metrics_port,
        listener,
        supervisor,
    }
}
