// Shared helpers for the scenario tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use odds_feed_rust::config::{BackoffPolicy, ListenerConfig, SupervisorConfig};
use odds_feed_rust::domain::{Fixture, Market, MatchStatus, Selection, SuspensionReason, SELECTION_ACTIVE};
use odds_feed_rust::facade::{FacadeError, ResourceFacade, UpdateStream};
use odds_feed_rust::plugin::PluginConsumer;
use odds_feed_rust::push::{ConnectionId, GroupHub, Notification, PushNotifier};
use odds_feed_rust::overview::{FixtureOverview, Overview, SportOverview};
use odds_feed_rust::supervisor::SupervisorHandle;

pub fn fixture(id: &str, sequence: u64, epoch: u64, status: MatchStatus) -> Fixture {
    Fixture {
        id: id.into(),
        sport: "Football".into(),
        description: Some(format!("{id} Home v Away")),
        sequence,
        epoch,
        match_status: Some(status),
        markets: vec![market("m1", 2.0)],
        ..Default::default()
    }
}

pub fn market(id: &str, price: f64) -> Market {
    Market {
        id: id.into(),
        name: Some("Match Odds".into()),
        is_pending: Some(false),
        is_resulted: Some(false),
        selections: vec![
            Selection {
                id: format!("{id}-home"),
                name: Some("Home".into()),
                price: Some(price),
                tradable: Some(true),
                status: Some(SELECTION_ACTIVE.into()),
            },
            Selection {
                id: format!("{id}-away"),
                name: Some("Away".into()),
                price: Some(price + 1.5),
                tradable: Some(true),
                status: Some(SELECTION_ACTIVE.into()),
            },
        ],
        ..Default::default()
    }
}

/// Quiet timers so scenario tests only see what they drive.
pub fn listener_cfg() -> ListenerConfig {
    ListenerConfig {
        staleness: Duration::from_secs(3_600),
        health_check_interval: Duration::from_secs(3_600),
        max_sequence_rejections: 3,
        reconnect: BackoffPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_millis(50),
            jitter_ms: 0,
        },
        max_reconnect_attempts: 2,
        diagnostics_interval: Duration::from_secs(3_600),
    }
}

pub fn supervisor_cfg() -> SupervisorConfig {
    SupervisorConfig {
        persist_interval: Duration::from_secs(3_600),
        diagnostics_interval: Duration::from_secs(3_600),
        ..Default::default()
    }
}

/// Facade driven by the test: snapshots are queued (the last one repeats),
/// every subscribe hands out a fresh channel the test can feed.
pub struct ScriptedFacade {
    fixture_id: String,
    sport: String,
    snapshots: Mutex<VecDeque<Result<Fixture, FacadeError>>>,
    current: Mutex<Option<Fixture>>,
    streams: Mutex<Vec<mpsc::UnboundedSender<Result<Fixture, FacadeError>>>>,
    subscribe_error: Mutex<Option<FacadeError>>,
    pub snapshot_calls: AtomicUsize,
    pub subscribe_calls: AtomicUsize,
    pub disconnect_calls: AtomicUsize,
}

impl ScriptedFacade {
    pub fn new(initial: Fixture) -> Arc<Self> {
        Arc::new(Self {
            fixture_id: initial.id.clone(),
            sport: initial.sport.clone(),
            snapshots: Mutex::new(VecDeque::new()),
            current: Mutex::new(Some(initial)),
            streams: Mutex::new(Vec::new()),
            subscribe_error: Mutex::new(None),
            snapshot_calls: AtomicUsize::new(0),
            subscribe_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
        })
    }

    /// Next snapshot served (after that, it keeps being served).
    pub fn set_snapshot(&self, f: Fixture) {
        *self.current.lock() = Some(f);
    }

    pub fn queue_snapshot_result(&self, r: Result<Fixture, FacadeError>) {
        self.snapshots.lock().push_back(r);
    }

    pub fn fail_subscribe(&self, e: Option<FacadeError>) {
        *self.subscribe_error.lock() = e;
    }

    /// Push an update into the most recent stream.
    pub fn push(&self, f: Fixture) {
        if let Some(tx) = self.streams.lock().last() {
            let _ = tx.send(Ok(f));
        }
    }

    pub fn push_err(&self, e: FacadeError) {
        if let Some(tx) = self.streams.lock().last() {
            let _ = tx.send(Err(e));
        }
    }

    /// Ends the most recent stream as if the connection dropped.
    pub fn drop_stream(&self) {
        self.streams.lock().pop();
    }

    pub fn snapshots(&self) -> usize {
        self.snapshot_calls.load(Ordering::SeqCst)
    }

    pub fn subscribes(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceFacade for ScriptedFacade {
    fn fixture_id(&self) -> &str {
        &self.fixture_id
    }

    fn sport(&self) -> &str {
        &self.sport
    }

    async fn get_snapshot(&self) -> Result<Fixture, FacadeError> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(r) = self.snapshots.lock().pop_front() {
            return r;
        }
        self.current
            .lock()
            .clone()
            .ok_or_else(|| FacadeError::ConnectionLost("no snapshot scripted".into()))
    }

    async fn subscribe_updates(&self) -> Result<UpdateStream, FacadeError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.subscribe_error.lock().clone() {
            return Err(e);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().push(tx);
        let s = stream::unfold(rx, |mut rx| async move {
            let item = rx.recv().await?;
            Some((item, rx))
        });
        Ok(s.boxed())
    }

    async fn disconnect(&self) {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PluginCall {
    Snapshot { sequence: u64, epoch_changed: bool },
    Update { sequence: u64, markets: Vec<String> },
    MatchStatus(Option<MatchStatus>),
    Deletion,
    Suspend(SuspensionReason),
    UnSuspend,
}

/// Records every callback; can be told to fail.
#[derive(Default)]
pub struct RecordingPlugin {
    pub calls: Mutex<Vec<PluginCall>>,
    pub fail: std::sync::atomic::AtomicBool,
}

impl RecordingPlugin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<PluginCall> {
        self.calls.lock().clone()
    }

    fn record(&self, c: PluginCall) -> anyhow::Result<()> {
        self.calls.lock().push(c);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("plugin exploded");
        }
        Ok(())
    }
}

#[async_trait]
impl PluginConsumer for RecordingPlugin {
    async fn process_snapshot(&self, fixture: &Fixture, epoch_changed: bool) -> anyhow::Result<()> {
        self.record(PluginCall::Snapshot { sequence: fixture.sequence, epoch_changed })
    }

    async fn process_stream_update(&self, fixture: &Fixture, _epoch_changed: bool) -> anyhow::Result<()> {
        self.record(PluginCall::Update {
            sequence: fixture.sequence,
            markets: fixture.markets.iter().map(|m| m.id.clone()).collect(),
        })
    }

    async fn process_match_status(&self, fixture: &Fixture) -> anyhow::Result<()> {
        self.record(PluginCall::MatchStatus(fixture.match_status))
    }

    async fn process_fixture_deletion(&self, _fixture: &Fixture) -> anyhow::Result<()> {
        self.record(PluginCall::Deletion)
    }

    async fn suspend(&self, _fixture_id: &str, reason: SuspensionReason) -> anyhow::Result<()> {
        self.record(PluginCall::Suspend(reason))
    }

    async fn unsuspend(&self, _fixture: &Fixture) -> anyhow::Result<()> {
        self.record(PluginCall::UnSuspend)
    }
}

/// GroupHub with one connection subscribed to the Football sport group.
pub struct Subscriber {
    pub hub: Arc<GroupHub>,
    pub conn: ConnectionId,
    pub rx: mpsc::UnboundedReceiver<Notification>,
}

impl Subscriber {
    pub async fn football() -> Self {
        let hub = Arc::new(GroupHub::new());
        let (conn, rx) = hub.connect();
        hub.join_sport_group(conn, "Football").await;
        Self { hub, conn, rx }
    }

    /// Sport notifications received so far.
    pub fn drain_sports(&mut self) -> Vec<SportOverview> {
        let mut out = Vec::new();
        while let Ok(n) = self.rx.try_recv() {
            if let Overview::Sport(s) = n.overview {
                out.push(s);
            }
        }
        out
    }
}

/// Polls the supervisor until the fixture overview satisfies `pred`.
pub async fn wait_for_fixture(
    sup: &SupervisorHandle,
    fixture_id: &str,
    pred: impl Fn(&FixtureOverview) -> bool,
) -> FixtureOverview {
    for _ in 0..400 {
        if let Some(d) = sup.get_fixture_detail(fixture_id).await {
            if pred(&d.overview) {
                return d.overview;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("fixture {fixture_id} never reached the expected overview");
}

pub async fn wait_until(what: &str, mut pred: impl FnMut() -> bool) {
    for _ in 0..400 {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}
