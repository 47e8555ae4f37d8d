// ===============================
// src/listener.rs
// ===============================
//
// One StreamListener per fixture. It owns the validator baseline and the
// MarketStateCollection of that fixture and processes its mailbox strictly in
// order:
//
//   Initializing -> Initialized   first snapshot applied
//   Initialized  -> Streaming     update stream attached
//   Streaming    -> Disconnected  stream dropped / health check stale
//   Disconnected -> Streaming     reconnect (snapshot if a gap shows up)
//   *            -> Errored       ordering faults beyond tolerance or reconnects
//                                 exhausted; a fresh snapshot brings it back
//   *            -> Stopped       stop / deleted / match over (terminal)
//
// The update stream is drained by a small pump task that forwards items into
// the mailbox tagged with a generation, so items from a torn-down stream are
// ignored.
//
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ListenerConfig;
use crate::domain::{Fixture, SuspensionReason};
use crate::facade::{FacadeError, ResourceFacade, UpdateStream};
use crate::mailbox::{mailbox, spawn_ticker, Band, Mailbox, MailboxReceiver, Prioritized};
use crate::market_state::MarketState;
use crate::market_states::{MarketStateCollection, MarketStatesSnapshot};
use crate::metrics;
use crate::overview::FixtureStateSummary;
use crate::plugin::PluginConsumer;
use crate::supervisor::SupervisorMsg;
use crate::validator::{validate, Baseline, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ListenerState {
    Initializing,
    Initialized,
    Streaming,
    Disconnected,
    Errored,
    Stopped,
}

impl ListenerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerState::Initializing => "initializing",
            ListenerState::Initialized => "initialized",
            ListenerState::Streaming => "streaming",
            ListenerState::Disconnected => "disconnected",
            ListenerState::Errored => "errored",
            ListenerState::Stopped => "stopped",
        }
    }
}

/// Upstream liveness probe. `last_sequence` is the sequence the feed claims
/// to be at, when known.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub fixture_id: String,
    pub last_sequence: Option<u64>,
    pub received_at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListenerStatus {
    pub fixture_id: String,
    pub sport: String,
    pub state: ListenerState,
    pub baseline: Option<Baseline>,
    pub market_count: usize,
    pub suspended_markets: usize,
    pub is_suspended: bool,
    pub rejections: u32,
    pub reconnect_attempts: u32,
    pub last_exception: Option<String>,
}

#[derive(Debug)]
pub enum ListenerMsg {
    StreamUpdate { generation: u64, fixture: Fixture },
    StreamEnded { generation: u64, error: Option<FacadeError> },
    HealthCheck(HealthCheck),
    TakeSnapshot,
    Suspend(SuspensionReason),
    UnSuspend,
    Reconnect,
    Restart,
    ClearState,
    GetMarkets(oneshot::Sender<MarketStatesSnapshot>),
    GetStatus(oneshot::Sender<ListenerStatus>),
    Stop,
    LogDiagnostics,
}

impl Prioritized for ListenerMsg {
    fn band(&self) -> Band {
        match self {
            ListenerMsg::LogDiagnostics => Band::Housekeeping,
            _ => Band::Control,
        }
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    // sender dropped != cancel
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn with_cancel<T>(
    cancel: &watch::Receiver<bool>,
    fut: impl Future<Output = Result<T, FacadeError>>,
) -> Result<T, FacadeError> {
    let mut rx = cancel.clone();
    tokio::select! {
        biased;
        _ = cancelled(&mut rx) => Err(FacadeError::Cancelled),
        r = fut => r,
    }
}

/// Stale = nothing accepted for longer than `staleness` while upstream is
/// (or may be) ahead of us.
pub fn is_stale(
    last_accepted: Instant,
    received_at: Instant,
    staleness: Duration,
    upstream_sequence: Option<u64>,
    baseline: Option<Baseline>,
) -> bool {
    if received_at.saturating_duration_since(last_accepted) <= staleness {
        return false;
    }
    match (upstream_sequence, baseline) {
        (Some(up), Some(b)) => up > b.sequence,
        _ => true,
    }
}

/// Header of `fixture` plus only the markets that actually changed.
pub fn build_delta(fixture: &Fixture, changed: &[MarketState]) -> Fixture {
    let ids: HashSet<&str> = changed.iter().map(|m| m.id.as_str()).collect();
    Fixture {
        markets: fixture
            .markets
            .iter()
            .filter(|m| ids.contains(m.id.as_str()))
            .cloned()
            .collect(),
        ..fixture.header()
    }
}

/// Partial overwrite of the fixture header: absent fields keep old values.
fn merge_header(dst: &mut Fixture, src: &Fixture) {
    dst.id = src.id.clone();
    if !src.sport.is_empty() {
        dst.sport = src.sport.clone();
    }
    if src.competition_id.is_some() {
        dst.competition_id = src.competition_id.clone();
    }
    if src.competition_name.is_some() {
        dst.competition_name = src.competition_name.clone();
    }
    if src.description.is_some() {
        dst.description = src.description.clone();
    }
    if src.start_time.is_some() {
        dst.start_time = src.start_time;
    }
    if src.match_status.is_some() {
        dst.match_status = src.match_status;
    }
    dst.sequence = src.sequence;
    dst.epoch = src.epoch;
    dst.last_epoch_change_reasons = src.last_epoch_change_reasons.clone();
}

fn spawn_pump(
    fixture_id: String,
    generation: u64,
    mut stream: UpdateStream,
    mailbox: Mailbox<ListenerMsg>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            let msg = match item {
                Ok(fixture) => ListenerMsg::StreamUpdate { generation, fixture },
                Err(FacadeError::MalformedPayload(e)) => {
                    metrics::UPDATES_REJECTED.with_label_values(&["malformed"]).inc();
                    warn!(%fixture_id, error = %e, "malformed update dropped");
                    continue;
                }
                Err(error) => {
                    let _ = mailbox.send(ListenerMsg::StreamEnded { generation, error: Some(error) });
                    return;
                }
            };
            if mailbox.send(msg).is_err() {
                return;
            }
        }
        let _ = mailbox.send(ListenerMsg::StreamEnded { generation, error: None });
    })
}

pub struct StreamListener {
    fixture_id: String,
    cfg: ListenerConfig,
    facade: Arc<dyn ResourceFacade>,
    plugin: Arc<dyn PluginConsumer>,
    supervisor: Mailbox<SupervisorMsg>,
    mailbox: Mailbox<ListenerMsg>,
    cancel: watch::Receiver<bool>,

    state: ListenerState,
    baseline: Option<Baseline>,
    header: Fixture,
    markets: MarketStateCollection,
    last_accepted_at: Instant,
    rejections: u32,
    reconnect_attempts: u32,
    resync_pending: bool,
    /// Sequence of a snapshot taken while the stream stayed attached. Stream
    /// items at or below it are backlog the snapshot already covers.
    snapshot_floor: Option<u64>,
    suspended: bool,
    admin_suspended: bool,
    deleted: bool,
    last_exception: Option<String>,
    last_summary: Option<FixtureStateSummary>,
    processed: u64,

    generation: u64,
    pump: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    tickers: Vec<JoinHandle<()>>,
}

impl StreamListener {
    pub async fn run(mut self, mut rx: MailboxReceiver<ListenerMsg>) {
        metrics::LISTENERS_BY_STATE.with_label_values(&[self.state.as_str()]).inc();
        info!(fixture_id = %self.fixture_id, sport = %self.header.sport, "listener starting");

        let id = self.fixture_id.clone();
        self.tickers.push(spawn_ticker(
            self.mailbox.clone(),
            self.cfg.health_check_interval,
            move || {
                ListenerMsg::HealthCheck(HealthCheck {
                    fixture_id: id.clone(),
                    last_sequence: None,
                    received_at: Instant::now(),
                })
            },
        ));
        self.tickers.push(spawn_ticker(
            self.mailbox.clone(),
            self.cfg.diagnostics_interval,
            || ListenerMsg::LogDiagnostics,
        ));

        self.initialize().await;

        let mut cancel = self.cancel.clone();
        while self.state != ListenerState::Stopped {
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => {
                    self.shutdown(Some(SuspensionReason::Disposing)).await;
                }
                msg = rx.recv() => match msg {
                    Some(msg) => {
                        self.processed += 1;
                        self.handle(msg).await;
                    }
                    None => self.shutdown(Some(SuspensionReason::Disposing)).await,
                }
            }
        }
        debug!(fixture_id = %self.fixture_id, processed = self.processed, "listener loop finished");
    }

    async fn handle(&mut self, msg: ListenerMsg) {
        match msg {
            ListenerMsg::StreamUpdate { generation, fixture } => {
                if generation != self.generation {
                    debug!(fixture_id = %self.fixture_id, generation, "update from old stream ignored");
                    return;
                }
                self.on_update(fixture).await;
            }
            ListenerMsg::StreamEnded { generation, error } => {
                if generation != self.generation || self.pump.is_none() {
                    return;
                }
                let err = error.unwrap_or_else(|| FacadeError::ConnectionLost("update stream closed".into()));
                self.fault(err, SuspensionReason::Disconnected).await;
            }
            ListenerMsg::HealthCheck(hc) => self.on_health_check(hc).await,
            ListenerMsg::TakeSnapshot => {
                info!(fixture_id = %self.fixture_id, "snapshot requested");
                self.resnapshot().await;
            }
            ListenerMsg::Suspend(reason) => self.admin_suspend(reason).await,
            ListenerMsg::UnSuspend => self.admin_unsuspend().await,
            ListenerMsg::Reconnect => self.on_reconnect().await,
            ListenerMsg::Restart => self.restart().await,
            ListenerMsg::ClearState => {
                info!(fixture_id = %self.fixture_id, markets = self.markets.len(), "clearing market state");
                self.markets.clear();
                self.resnapshot().await;
            }
            ListenerMsg::GetMarkets(reply) => {
                let _ = reply.send(self.markets.snapshot());
            }
            ListenerMsg::GetStatus(reply) => {
                let _ = reply.send(self.status());
            }
            ListenerMsg::Stop => self.shutdown(Some(SuspensionReason::Disposing)).await,
            ListenerMsg::LogDiagnostics => self.log_diagnostics(),
        }
    }

    // ---------------------------------------------------------------------
    // lifecycle
    // ---------------------------------------------------------------------

    async fn initialize(&mut self) {
        self.set_state(ListenerState::Initializing);

        let snap = match self.take_snapshot().await {
            Ok((snap, _)) => snap,
            Err(e) => return self.fault(e, SuspensionReason::SnapshotFailure).await,
        };
        self.set_state(ListenerState::Initialized);
        self.emit(true);
        if self.check_terminal(&snap).await {
            return;
        }

        match self.open_stream().await {
            Ok(()) => {
                self.set_state(ListenerState::Streaming);
                self.lift_suspension().await;
                self.emit(false);
                info!(fixture_id = %self.fixture_id, "streaming");
            }
            Err(e) => self.fault(e, SuspensionReason::Disconnected).await,
        }
    }

    /// Snapshot + (re)attach stream. Used from Errored and after a failed
    /// initialization.
    async fn recover(&mut self) {
        let snap = match self.take_snapshot().await {
            Ok((snap, _)) => snap,
            Err(e) => return self.fault(e, SuspensionReason::SnapshotFailure).await,
        };
        if self.pump.is_none() {
            if let Err(e) = self.open_stream().await {
                return self.fault(e, SuspensionReason::Disconnected).await;
            }
        }
        self.rejections = 0;
        self.reconnect_attempts = 0;
        self.resync_pending = false;
        self.set_state(ListenerState::Streaming);
        self.lift_suspension().await;
        self.emit(true);
        info!(fixture_id = %self.fixture_id, "recovered, streaming");
        self.check_terminal(&snap).await;
    }

    /// Fresh snapshot without touching the stream.
    async fn resnapshot(&mut self) {
        match self.take_snapshot().await {
            Ok((snap, changed)) => {
                self.rejections = 0;
                self.resync_pending = false;
                if self.state != ListenerState::Streaming && self.pump.is_some() {
                    self.set_state(ListenerState::Streaming);
                    self.lift_suspension().await;
                }
                self.emit(changed);
                self.check_terminal(&snap).await;
            }
            Err(e) => self.fault(e, SuspensionReason::SnapshotFailure).await,
        }
    }

    async fn restart(&mut self) {
        info!(fixture_id = %self.fixture_id, state = self.state.as_str(), "restarting listener");
        if let Some(t) = self.reconnect_timer.take() {
            t.abort();
        }
        self.close_stream().await;
        self.baseline = None;
        self.rejections = 0;
        self.reconnect_attempts = 0;
        self.resync_pending = false;
        self.initialize().await;
    }

    /// Terminal. Safe to call more than once.
    async fn shutdown(&mut self, reason: Option<SuspensionReason>) {
        if self.state == ListenerState::Stopped {
            return;
        }
        if let Some(t) = self.reconnect_timer.take() {
            t.abort();
        }
        for t in self.tickers.drain(..) {
            t.abort();
        }
        self.close_stream().await;
        if let Some(reason) = reason {
            let plugin = self.plugin.clone();
            self.call_plugin("suspend", plugin.suspend(&self.fixture_id, reason)).await;
            self.suspended = true;
        }
        self.set_state(ListenerState::Stopped);
        self.emit(false);
        info!(fixture_id = %self.fixture_id, processed = self.processed, "listener stopped");
    }

    // ---------------------------------------------------------------------
    // facade
    // ---------------------------------------------------------------------

    async fn take_snapshot(&mut self) -> Result<(Fixture, bool), FacadeError> {
        let facade = self.facade.clone();
        let snap = with_cancel(&self.cancel, facade.get_snapshot()).await?;
        if snap.id != self.fixture_id {
            return Err(FacadeError::MalformedPayload(format!(
                "snapshot for {} delivered to listener {}",
                snap.id, self.fixture_id
            )));
        }

        let v = validate(self.baseline, snap.sequence, snap.epoch, true);
        debug!(fixture_id = %self.fixture_id, explanation = %v.explanation, "snapshot");
        let changed = self.apply(&snap, true, v.epoch_changed).await;
        self.snapshot_floor = self.pump.is_some().then_some(snap.sequence);
        Ok((snap, changed))
    }

    async fn open_stream(&mut self) -> Result<(), FacadeError> {
        let facade = self.facade.clone();
        let stream = with_cancel(&self.cancel, facade.subscribe_updates()).await?;
        if let Some(old) = self.pump.take() {
            old.abort();
        }
        self.generation += 1;
        self.pump = Some(spawn_pump(
            self.fixture_id.clone(),
            self.generation,
            stream,
            self.mailbox.clone(),
        ));
        self.last_accepted_at = Instant::now();
        Ok(())
    }

    async fn close_stream(&mut self) {
        if let Some(p) = self.pump.take() {
            p.abort();
            self.generation += 1;
            self.facade.disconnect().await;
        }
    }

    /// Transport / snapshot failure handling.
    async fn fault(&mut self, e: FacadeError, reason: SuspensionReason) {
        match e {
            FacadeError::Cancelled => {
                debug!(fixture_id = %self.fixture_id, "facade call cancelled");
            }
            e if !e.is_recoverable() => {
                error!(fixture_id = %self.fixture_id, error = %e, "unrecoverable facade fault, stopping listener");
                self.last_exception = Some(e.to_string());
                self.shutdown(Some(SuspensionReason::FixtureErrored)).await;
            }
            e => {
                warn!(fixture_id = %self.fixture_id, error = %e, reason = reason.as_str(), "feed fault");
                self.last_exception = Some(e.to_string());
                self.close_stream().await;
                self.suspend_plugin(reason).await;
                if self.state != ListenerState::Errored {
                    self.set_state(ListenerState::Disconnected);
                }
                self.emit(false);
                self.schedule_reconnect().await;
            }
        }
    }

    async fn schedule_reconnect(&mut self) {
        if self.state == ListenerState::Stopped {
            return;
        }
        if self.reconnect_attempts >= self.cfg.max_reconnect_attempts && self.state != ListenerState::Errored {
            let why = format!("reconnect failed {} times", self.reconnect_attempts);
            self.mark_errored(why).await;
        }

        let delay = self.cfg.reconnect.delay(self.reconnect_attempts);
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        if let Some(t) = self.reconnect_timer.take() {
            t.abort();
        }
        let mb = self.mailbox.clone();
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = mb.send(ListenerMsg::Reconnect);
        }));
        info!(
            fixture_id = %self.fixture_id,
            attempt = self.reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
    }

    async fn on_reconnect(&mut self) {
        self.reconnect_timer = None;
        match self.state {
            ListenerState::Stopped | ListenerState::Streaming => {
                debug!(fixture_id = %self.fixture_id, state = self.state.as_str(), "reconnect not needed");
            }
            ListenerState::Disconnected if self.baseline.is_some() => {
                metrics::RECONNECTS.inc();
                match self.open_stream().await {
                    Ok(()) => {
                        // continuity is checked on the first update
                        self.resync_pending = true;
                        self.reconnect_attempts = 0;
                        self.set_state(ListenerState::Streaming);
                        self.lift_suspension().await;
                        self.emit(false);
                        info!(fixture_id = %self.fixture_id, "reconnected");
                    }
                    Err(e) => self.fault(e, SuspensionReason::Disconnected).await,
                }
            }
            _ => {
                metrics::RECONNECTS.inc();
                self.recover().await;
            }
        }
    }

    // ---------------------------------------------------------------------
    // payloads
    // ---------------------------------------------------------------------

    async fn on_update(&mut self, fixture: Fixture) {
        metrics::UPDATES_BY_FIXTURE.with_label_values(&[self.fixture_id.as_str()]).inc();
        if fixture.id != self.fixture_id {
            warn!(fixture_id = %self.fixture_id, got = %fixture.id, "update for another fixture dropped");
            return;
        }

        let v = validate(self.baseline, fixture.sequence, fixture.epoch, false);
        match v.verdict {
            Verdict::Accept => {
                self.rejections = 0;
                self.snapshot_floor = None;
                if self.resync_pending {
                    self.resync_pending = false;
                    if let Some(gap) = v.gap {
                        info!(fixture_id = %self.fixture_id, gap, "gap after reconnect, resyncing from snapshot");
                        return self.resnapshot().await;
                    }
                }
                if let Some(gap) = v.gap {
                    debug!(fixture_id = %self.fixture_id, gap, "sequence gap tolerated");
                }
                metrics::UPDATES_ACCEPTED.inc();
                let changed = self.apply(&fixture, false, false).await;
                self.emit(changed);
                self.check_terminal(&fixture).await;
            }
            Verdict::RejectEpoch if v.epoch_changed => {
                metrics::UPDATES_REJECTED.with_label_values(&[v.verdict.as_str()]).inc();
                self.on_epoch_change(fixture, &v.explanation).await;
            }
            Verdict::RejectSequence | Verdict::RejectEpoch
                if self.snapshot_floor.map_or(false, |floor| fixture.sequence <= floor) =>
            {
                metrics::UPDATES_REJECTED.with_label_values(&["covered_by_snapshot"]).inc();
                debug!(
                    fixture_id = %self.fixture_id,
                    sequence = fixture.sequence,
                    floor = ?self.snapshot_floor,
                    "update already covered by snapshot, dropped"
                );
            }
            Verdict::RejectSequence | Verdict::RejectEpoch => {
                metrics::UPDATES_REJECTED.with_label_values(&[v.verdict.as_str()]).inc();
                self.rejections += 1;
                warn!(
                    fixture_id = %self.fixture_id,
                    sequence = fixture.sequence,
                    epoch = fixture.epoch,
                    rejections = self.rejections,
                    explanation = %v.explanation,
                    "update rejected"
                );
                if self.rejections > self.cfg.max_sequence_rejections {
                    let why = format!("{} consecutive ordering rejections", self.rejections);
                    self.mark_errored(why).await;
                    self.recover().await;
                }
            }
        }
    }

    async fn on_epoch_change(&mut self, fixture: Fixture, explanation: &str) {
        info!(
            fixture_id = %self.fixture_id,
            reasons = ?fixture.last_epoch_change_reasons,
            %explanation,
            "epoch changed, fetching snapshot"
        );
        if fixture.is_deleted() {
            return self.retire_deleted(&fixture).await;
        }
        if fixture.match_status.is_some() && fixture.match_status != self.header.match_status {
            self.header.match_status = fixture.match_status;
            let plugin = self.plugin.clone();
            self.call_plugin("process_match_status", plugin.process_match_status(&fixture))
                .await;
        }
        self.resnapshot().await;
    }

    /// Reconcile an accepted payload. Returns true when something observable
    /// changed (always for snapshots).
    async fn apply(&mut self, fixture: &Fixture, is_snapshot: bool, epoch_changed: bool) -> bool {
        let started = std::time::Instant::now();
        let status_changed = fixture.match_status.is_some() && fixture.match_status != self.header.match_status;

        merge_header(&mut self.header, fixture);
        let changed = self.markets.update(fixture, is_snapshot);
        self.baseline = Some(Baseline { sequence: fixture.sequence, epoch: fixture.epoch });
        self.last_accepted_at = Instant::now();
        metrics::MARKETS_CHANGED.inc_by(changed.len() as u64);

        let plugin = self.plugin.clone();
        if is_snapshot {
            metrics::SNAPSHOTS.inc();
            self.call_plugin("process_snapshot", plugin.process_snapshot(fixture, epoch_changed))
                .await;
        } else if !changed.is_empty() {
            let delta = build_delta(fixture, &changed);
            self.call_plugin("process_stream_update", plugin.process_stream_update(&delta, epoch_changed))
                .await;
        }
        if status_changed {
            self.call_plugin("process_match_status", plugin.process_match_status(fixture))
                .await;
        }

        metrics::LAT_APPLY.observe(started.elapsed().as_secs_f64() * 1_000.0);
        debug!(
            fixture_id = %self.fixture_id,
            sequence = fixture.sequence,
            changed = changed.len(),
            is_snapshot,
            "applied"
        );
        is_snapshot || !changed.is_empty() || status_changed
    }

    /// Stops the listener for deleted / finished fixtures. Returns true if
    /// it did.
    async fn check_terminal(&mut self, fixture: &Fixture) -> bool {
        if fixture.is_deleted() {
            self.retire_deleted(fixture).await;
            return true;
        }
        if self.header.is_match_over() {
            info!(fixture_id = %self.fixture_id, "match over, stopping listener");
            self.shutdown(None).await;
            return true;
        }
        false
    }

    async fn retire_deleted(&mut self, fixture: &Fixture) {
        warn!(fixture_id = %self.fixture_id, "fixture deleted upstream");
        let plugin = self.plugin.clone();
        self.call_plugin("process_fixture_deletion", plugin.process_fixture_deletion(fixture))
            .await;
        self.deleted = true;
        self.shutdown(Some(SuspensionReason::FixtureDeleted)).await;
    }

    // ---------------------------------------------------------------------
    // health / suspension
    // ---------------------------------------------------------------------

    async fn on_health_check(&mut self, hc: HealthCheck) {
        if self.state != ListenerState::Streaming {
            return;
        }
        if !is_stale(
            self.last_accepted_at,
            hc.received_at,
            self.cfg.staleness,
            hc.last_sequence,
            self.baseline,
        ) {
            return;
        }

        let silent = hc.received_at.saturating_duration_since(self.last_accepted_at);
        metrics::HEALTH_CHECK_FAILURES.inc();
        warn!(
            fixture_id = %self.fixture_id,
            silent_secs = silent.as_secs(),
            upstream_sequence = ?hc.last_sequence,
            "health check failed, stream stale"
        );
        self.last_exception = Some(format!("no accepted update for {}s", silent.as_secs()));
        self.close_stream().await;
        self.suspend_plugin(SuspensionReason::HealthCheckFailure).await;
        self.set_state(ListenerState::Disconnected);
        self.emit(false);
        self.schedule_reconnect().await;
    }

    async fn mark_errored(&mut self, why: String) {
        warn!(fixture_id = %self.fixture_id, %why, "listener errored");
        self.last_exception = Some(why);
        self.suspend_plugin(SuspensionReason::FixtureErrored).await;
        self.set_state(ListenerState::Errored);
        self.emit(false);
    }

    async fn suspend_plugin(&mut self, reason: SuspensionReason) {
        if self.suspended {
            return;
        }
        self.suspended = true;
        let plugin = self.plugin.clone();
        self.call_plugin("suspend", plugin.suspend(&self.fixture_id, reason)).await;
    }

    async fn lift_suspension(&mut self) {
        if !self.suspended {
            return;
        }
        self.suspended = false;
        if self.admin_suspended {
            return;
        }
        let plugin = self.plugin.clone();
        let header = self.header.clone();
        self.call_plugin("unsuspend", plugin.unsuspend(&header)).await;
    }

    async fn admin_suspend(&mut self, reason: SuspensionReason) {
        let flipped = self.markets.force_suspend_all();
        self.admin_suspended = true;
        info!(fixture_id = %self.fixture_id, markets = flipped.len(), reason = reason.as_str(), "suspended by admin");
        let plugin = self.plugin.clone();
        self.call_plugin("suspend", plugin.suspend(&self.fixture_id, reason)).await;
        self.emit(false);
    }

    async fn admin_unsuspend(&mut self) {
        let flipped = self.markets.force_unsuspend_all();
        self.admin_suspended = false;
        info!(fixture_id = %self.fixture_id, markets = flipped.len(), "unsuspended by admin");
        if !self.suspended {
            let plugin = self.plugin.clone();
            let header = self.header.clone();
            self.call_plugin("unsuspend", plugin.unsuspend(&header)).await;
        }
        self.emit(false);
    }

    /// Plugin failures (errors and panics) never reach the listener.
    async fn call_plugin<F>(&self, callback: &'static str, fut: F)
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                metrics::PLUGIN_ERRORS.with_label_values(&[callback]).inc();
                warn!(fixture_id = %self.fixture_id, callback, error = %format!("{e:#}"), "plugin callback failed");
            }
            Err(_) => {
                metrics::PLUGIN_ERRORS.with_label_values(&[callback]).inc();
                error!(fixture_id = %self.fixture_id, callback, "plugin callback panicked");
            }
        }
    }

    // ---------------------------------------------------------------------
    // reporting
    // ---------------------------------------------------------------------

    fn set_state(&mut self, next: ListenerState) {
        if self.state == next {
            return;
        }
        metrics::LISTENERS_BY_STATE.with_label_values(&[self.state.as_str()]).dec();
        metrics::LISTENERS_BY_STATE.with_label_values(&[next.as_str()]).inc();
        debug!(fixture_id = %self.fixture_id, from = self.state.as_str(), to = next.as_str(), "state");
        self.state = next;
    }

    fn summary(&self) -> FixtureStateSummary {
        let (sequence, epoch) = self
            .baseline
            .map(|b| (b.sequence, b.epoch))
            .unwrap_or((self.header.sequence, self.header.epoch));
        FixtureStateSummary {
            fixture_id: self.fixture_id.clone(),
            sport: self.header.sport.clone(),
            description: self.header.description.clone(),
            competition_id: self.header.competition_id.clone(),
            competition_name: self.header.competition_name.clone(),
            start_time: self.header.start_time,
            sequence,
            epoch,
            match_status: self.header.match_status,
            listener_state: self.state,
            is_streaming: self.state == ListenerState::Streaming,
            is_errored: self.state == ListenerState::Errored,
            is_suspended: self.suspended || self.admin_suspended,
            is_deleted: self.deleted,
            is_over: self.header.is_match_over(),
            last_exception: self.last_exception.clone(),
        }
    }

    /// Sends a summary to the supervisor. Without `force` it is skipped when
    /// nothing but the sequence moved since the last one.
    fn emit(&mut self, force: bool) {
        let s = self.summary();
        let unchanged = self.last_summary.as_ref().map_or(false, |last| {
            FixtureStateSummary { sequence: s.sequence, epoch: s.epoch, ..last.clone() } == s
        });
        if !force && unchanged {
            return;
        }
        if self.supervisor.send(SupervisorMsg::FixtureState(s.clone())).is_err() {
            debug!(fixture_id = %self.fixture_id, "supervisor gone, summary dropped");
        }
        self.last_summary = Some(s);
    }

    fn status(&self) -> ListenerStatus {
        ListenerStatus {
            fixture_id: self.fixture_id.clone(),
            sport: self.header.sport.clone(),
            state: self.state,
            baseline: self.baseline,
            market_count: self.markets.len(),
            suspended_markets: self.markets.suspended_count(),
            is_suspended: self.suspended || self.admin_suspended,
            rejections: self.rejections,
            reconnect_attempts: self.reconnect_attempts,
            last_exception: self.last_exception.clone(),
        }
    }

    fn log_diagnostics(&self) {
        debug!(
            fixture_id = %self.fixture_id,
            state = self.state.as_str(),
            baseline = ?self.baseline,
            markets = self.markets.len(),
            suspended_markets = self.markets.suspended_count(),
            rejections = self.rejections,
            processed = self.processed,
            "listener diagnostics"
        );
    }
}

/// Owner side of a running listener.
pub struct ListenerHandle {
    fixture_id: String,
    sport: String,
    mailbox: Mailbox<ListenerMsg>,
    cancel_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn fixture_id(&self) -> &str {
        &self.fixture_id
    }

    pub fn sport(&self) -> &str {
        &self.sport
    }

    pub fn mailbox(&self) -> Mailbox<ListenerMsg> {
        self.mailbox.clone()
    }

    /// False once the listener is gone.
    pub fn send(&self, msg: ListenerMsg) -> bool {
        self.mailbox.send(msg).is_ok()
    }

    /// Cancels in-flight facade calls and stops the listener. Idempotent.
    pub fn stop(&self) {
        let _ = self.mailbox.send(ListenerMsg::Stop);
        self.cancel_tx.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn markets(&self) -> Option<MarketStatesSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.send(ListenerMsg::GetMarkets(tx)).ok()?;
        rx.await.ok()
    }

    pub async fn status(&self) -> Option<ListenerStatus> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.send(ListenerMsg::GetStatus(tx)).ok()?;
        rx.await.ok()
    }

    pub async fn join(self) {
        if let Err(e) = self.join.await {
            error!(fixture_id = %self.fixture_id, ?e, "listener task failed");
        }
    }
}

pub fn spawn_listener(
    facade: Arc<dyn ResourceFacade>,
    plugin: Arc<dyn PluginConsumer>,
    supervisor: Mailbox<SupervisorMsg>,
    cfg: ListenerConfig,
) -> ListenerHandle {
    let fixture_id = facade.fixture_id().to_string();
    let sport = facade.sport().to_string();
    let (tx, rx) = mailbox::<ListenerMsg>();
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let listener = StreamListener {
        fixture_id: fixture_id.clone(),
        cfg,
        facade,
        plugin,
        supervisor,
        mailbox: tx.clone(),
        cancel: cancel_rx,
        state: ListenerState::Initializing,
        baseline: None,
        header: Fixture { id: fixture_id.clone(), sport: sport.clone(), ..Default::default() },
        markets: MarketStateCollection::new(fixture_id.clone(), sport.clone()),
        last_accepted_at: Instant::now(),
        rejections: 0,
        reconnect_attempts: 0,
        resync_pending: false,
        snapshot_floor: None,
        suspended: false,
        admin_suspended: false,
        deleted: false,
        last_exception: None,
        last_summary: None,
        processed: 0,
        generation: 0,
        pump: None,
        reconnect_timer: None,
        tickers: Vec::new(),
    };
    let join = tokio::spawn(listener.run(rx));

    ListenerHandle { fixture_id, sport, mailbox: tx, cancel_tx, join }
}
