// ===============================
// src/main.rs
// ===============================
/*
 # listener per state & penolakan update
curl -s localhost:9898/metrics | egrep '^(listeners_by_state|updates_rejected_total)'

# aktivitas per fixture
curl -s localhost:9898/metrics | grep '^updates_total_by_fixture'

# konfigurasi yang aktif
curl -s localhost:9898/metrics | egrep '^config_(feed_mode|fixture)'
*/
/*
=============================================================================
Project : odds_feed_rust — per-fixture odds stream reconciliation in Rust
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Listens to per-fixture odds streams (mock/remote), validates
          sequence/epoch ordering, reconciles market/selection state,
          forwards real changes to a plugin, aggregates sport/fixture
          overviews for push subscribers, exposes Prometheus metrics and
          records JSONL events.
=============================================================================
*/
use std::collections::BTreeSet;
use std::sync::Arc;

use clap::Parser;
use tokio::{
    select,
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use odds_feed_rust::adapter::Adapter;
use odds_feed_rust::config::{self, FeedMode};
use odds_feed_rust::domain::Event;
use odds_feed_rust::facade::{MockFacade, RemoteFacade, ResourceFacade};
use odds_feed_rust::metrics;
use odds_feed_rust::plugin::LoggingPlugin;
use odds_feed_rust::push::{GroupHub, PushNotifier};
use odds_feed_rust::recorder;
use odds_feed_rust::store::{FileStore, StateStore};

const MOCK_TICK: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ---- Load config ----
    let cli = config::Cli::parse();
    let args = config::load(&cli);
    if args.fixtures.is_empty() {
        anyhow::bail!("no fixtures configured (FIXTURES or --fixtures)");
    }

    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(args.metrics_port);

    info!(
        feed_mode = args.feed_mode.as_str(),
        fixtures = ?args.fixtures.iter().map(|f| format!("{}:{}", f.sport, f.id)).collect::<Vec<_>>(),
        rest = %args.rest_url,
        ws = %args.ws_url,
        store_dir = %args.store_dir,
        staleness_secs = args.listener.staleness.as_secs(),
        "startup config"
    );
    metrics::CONFIG_FEED_MODE
        .with_label_values(&[args.feed_mode.as_str()])
        .set(1);
    for f in &args.fixtures {
        metrics::CONFIG_FIXTURE
            .with_label_values(&[f.sport.as_str(), f.id.as_str()])
            .set(1);
    }

    // ---- Recorder (optional) ----
    let rec_tx = match args.record_file.clone() {
        Some(path) => {
            let (tx, rx) = mpsc::channel::<Event>(8192);
            tokio::spawn(recorder::run(rx, path));
            Some(tx)
        }
        None => None,
    };

    // ---- Boundaries ----
    let plugin = Arc::new(LoggingPlugin::new(rec_tx));
    let store: Arc<dyn StateStore> = Arc::new(FileStore::new(&args.store_dir));
    let hub = Arc::new(GroupHub::new());

    let mut adapter = Adapter::start(
        args.listener.clone(),
        args.supervisor.clone(),
        store,
        hub.clone(),
        plugin,
    );

    // ---- One listener per fixture ----
    for f in &args.fixtures {
        let facade: Arc<dyn ResourceFacade> = match args.feed_mode {
            FeedMode::Mock => Arc::new(MockFacade::new(&f.id, &f.sport, MOCK_TICK)),
            FeedMode::Remote => Arc::new(RemoteFacade::new(
                &f.id,
                &f.sport,
                &args.rest_url,
                &args.ws_url,
                args.api_token.clone(),
            )),
        };
        adapter.add_fixture(facade);
    }

    // ---- Console subscriber: semua sport group ----
    let (conn, mut notes) = hub.connect();
    let sports: BTreeSet<&str> = args.fixtures.iter().map(|f| f.sport.as_str()).collect();
    for sport in sports {
        hub.join_sport_group(conn, sport).await;
    }

    // ---- Heartbeat sampai Ctrl-C ----
    let supervisor = adapter.supervisor().clone();
    let mut heartbeat = interval(Duration::from_secs(10));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            Some(n) = notes.recv() => {
                info!(group = %n.group, key = %n.overview.key(), "push");
            },
            _ = heartbeat.tick() => {
                if let Some(st) = supervisor.get_adapter_status().await {
                    info!(
                        listeners = st.listener_count,
                        fixtures = st.fixture_count,
                        in_error = st.fixtures_in_error,
                        messages = st.messages_processed,
                        uptime_secs = st.uptime_secs,
                        "heartbeat"
                    );
                }
            },
            r = tokio::signal::ctrl_c() => {
                if let Err(e) = r {
                    warn!(?e, "ctrl-c handler failed");
                }
                info!("shutdown requested");
                break;
            }
        }
    }

    hub.disconnect(conn);
    adapter.shutdown().await;
    Ok(())
}
