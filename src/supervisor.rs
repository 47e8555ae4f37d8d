// ===============================
// src/supervisor.rs
// ===============================
//
// Single aggregation actor:
// - upserts a FixtureOverview for every listener summary
// - recomputes the SportOverview of that sport and pushes it only when it
//   differs from what was last published
// - answers admin queries, forwards admin commands to registered listeners
// - persists the fixture map periodically and on shutdown
//
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::listener::{ListenerMsg, ListenerState};
use crate::mailbox::{mailbox, spawn_ticker, Band, Mailbox, MailboxReceiver, Prioritized};
use crate::metrics;
use crate::overview::{
    AdapterStatus, FixtureDetail, FixtureHistoryEntry, FixtureOverview, FixtureStateSummary, SportDetail,
    SportOverview,
};
use crate::push::PushNotifier;
use crate::store::{FixtureMap, StateStore};

#[derive(Debug)]
pub enum SupervisorMsg {
    FixtureState(FixtureStateSummary),
    RegisterListener { fixture_id: String, mailbox: Mailbox<ListenerMsg> },
    UnregisterListener(String),
    TakeSnapshot(String),
    RestartListener(String),
    ClearState(String),
    GetSports(oneshot::Sender<Vec<SportOverview>>),
    GetSportDetail(String, oneshot::Sender<Option<SportDetail>>),
    GetFixtureDetail(String, oneshot::Sender<Option<FixtureDetail>>),
    GetFixtureHistory(String, oneshot::Sender<Vec<FixtureHistoryEntry>>),
    GetFixtures(oneshot::Sender<Vec<FixtureOverview>>),
    GetAdapterStatus(oneshot::Sender<AdapterStatus>),
    Shutdown(oneshot::Sender<()>),
    PersistState,
    LogDiagnostics,
}

impl Prioritized for SupervisorMsg {
    fn band(&self) -> Band {
        match self {
            SupervisorMsg::PersistState | SupervisorMsg::LogDiagnostics => Band::Housekeeping,
            _ => Band::Control,
        }
    }
}

pub struct Supervisor {
    cfg: SupervisorConfig,
    store: Arc<dyn StateStore>,
    push: Arc<dyn PushNotifier>,

    fixtures: FixtureMap,
    // last published per sport
    sports: BTreeMap<String, SportOverview>,
    history: HashMap<String, VecDeque<FixtureHistoryEntry>>,
    listeners: HashMap<String, Mailbox<ListenerMsg>>,

    started_at: DateTime<Utc>,
    messages: u64,
    sport_pushes: u64,
    fixture_pushes: u64,
    dirty: bool,
}

impl Supervisor {
    pub fn new(cfg: SupervisorConfig, store: Arc<dyn StateStore>, push: Arc<dyn PushNotifier>) -> Self {
        Self {
            cfg,
            store,
            push,
            fixtures: FixtureMap::new(),
            sports: BTreeMap::new(),
            history: HashMap::new(),
            listeners: HashMap::new(),
            started_at: Utc::now(),
            messages: 0,
            sport_pushes: 0,
            fixture_pushes: 0,
            dirty: false,
        }
    }

    pub async fn run(mut self, self_tx: Mailbox<SupervisorMsg>, mut rx: MailboxReceiver<SupervisorMsg>) {
        self.load_state().await;

        let tickers = [
            spawn_ticker(self_tx.clone(), self.cfg.persist_interval, || SupervisorMsg::PersistState),
            spawn_ticker(self_tx, self.cfg.diagnostics_interval, || SupervisorMsg::LogDiagnostics),
        ];
        info!(fixtures = self.fixtures.len(), "supervisor started");

        while let Some(msg) = rx.recv().await {
            self.messages += 1;
            if let SupervisorMsg::Shutdown(reply) = msg {
                self.persist().await;
                let _ = reply.send(());
                break;
            }
            self.handle(msg).await;
        }

        for t in tickers {
            t.abort();
        }
        info!(messages = self.messages, "supervisor stopped");
    }

    async fn handle(&mut self, msg: SupervisorMsg) {
        match msg {
            SupervisorMsg::FixtureState(s) => self.on_fixture_state(s).await,
            SupervisorMsg::RegisterListener { fixture_id, mailbox } => {
                if mailbox.is_closed() {
                    debug!(%fixture_id, "listener already gone, not registered");
                    return;
                }
                debug!(%fixture_id, "listener registered");
                self.listeners.insert(fixture_id, mailbox);
            }
            SupervisorMsg::UnregisterListener(id) => {
                self.listeners.remove(&id);
                self.history.remove(&id);
            }
            SupervisorMsg::TakeSnapshot(id) => self.forward(&id, ListenerMsg::TakeSnapshot),
            SupervisorMsg::RestartListener(id) => self.forward(&id, ListenerMsg::Restart),
            SupervisorMsg::ClearState(id) => self.forward(&id, ListenerMsg::ClearState),
            SupervisorMsg::GetSports(reply) => {
                let _ = reply.send(self.sports.values().cloned().collect());
            }
            SupervisorMsg::GetSportDetail(code, reply) => {
                let _ = reply.send(self.sport_detail(&code));
            }
            SupervisorMsg::GetFixtureDetail(id, reply) => {
                let _ = reply.send(self.fixture_detail(&id));
            }
            SupervisorMsg::GetFixtureHistory(id, reply) => {
                let h = self
                    .history
                    .get(&id)
                    .map(|h| h.iter().cloned().collect())
                    .unwrap_or_default();
                let _ = reply.send(h);
            }
            SupervisorMsg::GetFixtures(reply) => {
                let _ = reply.send(self.fixtures.values().cloned().collect());
            }
            SupervisorMsg::GetAdapterStatus(reply) => {
                let _ = reply.send(self.adapter_status());
            }
            SupervisorMsg::PersistState => {
                if self.dirty {
                    self.persist().await;
                }
            }
            SupervisorMsg::LogDiagnostics => {
                debug!(
                    fixtures = self.fixtures.len(),
                    sports = self.sports.len(),
                    listeners = self.listeners.len(),
                    messages = self.messages,
                    sport_pushes = self.sport_pushes,
                    fixture_pushes = self.fixture_pushes,
                    "supervisor diagnostics"
                );
            }
            // handled in run()
            SupervisorMsg::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    async fn on_fixture_state(&mut self, s: FixtureStateSummary) {
        let ov = FixtureOverview::from_summary(&s, Utc::now());
        let previous_sport = match self.fixtures.get(&ov.id) {
            Some(old) if old.same_content(&ov) => {
                debug!(fixture_id = %ov.id, "overview unchanged");
                return;
            }
            Some(old) => Some(old.sport.clone()),
            None => None,
        };

        self.record_history(&ov);
        self.fixtures.insert(ov.id.clone(), ov.clone());
        self.dirty = true;
        metrics::FIXTURES_KNOWN.set(self.fixtures.len() as i64);

        self.push.publish_fixture_update(&ov).await;
        self.fixture_pushes += 1;
        metrics::PUSHES.with_label_values(&["fixture"]).inc();

        self.refresh_sport(&ov.sport).await;
        if let Some(old) = previous_sport.filter(|old| *old != ov.sport) {
            self.refresh_sport(&old).await;
        }

        // Stopped is the last summary a listener sends
        if ov.listener_state == ListenerState::Stopped {
            if self.listeners.remove(&ov.id).is_some() {
                debug!(fixture_id = %ov.id, "stopped listener unregistered");
            }
            if ov.is_retired() {
                self.history.remove(&ov.id);
            }
        }
    }

    async fn refresh_sport(&mut self, sport: &str) {
        let next = SportOverview::from_fixtures(sport, self.fixtures.values());
        if self.sports.get(sport) == Some(&next) {
            return;
        }
        info!(
            sport = %sport,
            total = next.total,
            in_play = next.in_play,
            in_pre_match = next.in_pre_match,
            in_setup = next.in_setup,
            in_error = next.in_error,
            "sport overview changed"
        );
        self.push.publish_sport_update(&next).await;
        self.sport_pushes += 1;
        metrics::PUSHES.with_label_values(&["sport"]).inc();
        self.sports.insert(sport.to_string(), next);
    }

    fn record_history(&mut self, ov: &FixtureOverview) {
        let cap = self.cfg.history_len.max(1);
        let h = self.history.entry(ov.id.clone()).or_default();
        h.push_back(FixtureHistoryEntry::from(ov));
        while h.len() > cap {
            h.pop_front();
        }
    }

    fn forward(&mut self, fixture_id: &str, msg: ListenerMsg) {
        let Some(mb) = self.listeners.get(fixture_id) else {
            warn!(%fixture_id, "admin command for unknown fixture ignored");
            return;
        };
        if mb.send(msg).is_err() {
            warn!(%fixture_id, "listener gone, dropping registration");
            self.listeners.remove(fixture_id);
        }
    }

    fn sport_detail(&self, code: &str) -> Option<SportDetail> {
        let overview = self.sports.get(code)?.clone();
        let mut fixtures: Vec<FixtureOverview> =
            self.fixtures.values().filter(|f| f.sport == code).cloned().collect();
        fixtures.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        Some(SportDetail { overview, fixtures })
    }

    fn fixture_detail(&self, id: &str) -> Option<FixtureDetail> {
        let overview = self.fixtures.get(id)?.clone();
        let history = self
            .history
            .get(id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default();
        Some(FixtureDetail { overview, history, has_listener: self.listeners.contains_key(id) })
    }

    fn adapter_status(&self) -> AdapterStatus {
        AdapterStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            listener_count: self.listeners.values().filter(|m| !m.is_closed()).count(),
            fixture_count: self.fixtures.len(),
            sport_count: self.sports.len(),
            fixtures_in_error: self.fixtures.values().filter(|f| f.is_in_error_state).count(),
            messages_processed: self.messages,
            sport_pushes: self.sport_pushes,
            fixture_pushes: self.fixture_pushes,
        }
    }

    // -----------------------------------------------------------------
    // persisted state
    // -----------------------------------------------------------------

    async fn load_state(&mut self) {
        let key = self.cfg.state_key.clone();
        match self.store.get_object(&key).await {
            Ok(Some(map)) => {
                info!(%key, fixtures = map.len(), "persisted fixture state loaded");
                self.fixtures = map;
                let sports: Vec<String> = self.fixtures.values().map(|f| f.sport.clone()).collect();
                for sport in sports {
                    let o = SportOverview::from_fixtures(&sport, self.fixtures.values());
                    self.sports.insert(sport, o);
                }
                metrics::FIXTURES_KNOWN.set(self.fixtures.len() as i64);
            }
            Ok(None) => info!(%key, "no persisted fixture state"),
            Err(e) => {
                metrics::STORE_ERRORS.with_label_values(&["get"]).inc();
                warn!(%key, error = %e, "persisted state unreadable, starting empty");
                if let Err(e) = self.store.remove(&key).await {
                    metrics::STORE_ERRORS.with_label_values(&["remove"]).inc();
                    warn!(%key, error = %e, "failed to discard persisted state");
                }
            }
        }
    }

    async fn persist(&mut self) {
        match self.store.set_object(&self.cfg.state_key, &self.fixtures).await {
            Ok(()) => {
                self.dirty = false;
                debug!(fixtures = self.fixtures.len(), "fixture state persisted");
            }
            Err(e) => {
                metrics::STORE_ERRORS.with_label_values(&["set"]).inc();
                warn!(error = %e, "persisting fixture state failed");
            }
        }
    }
}

/// Clonable front door to the supervisor actor.
#[derive(Clone)]
pub struct SupervisorHandle {
    mailbox: Mailbox<SupervisorMsg>,
}

impl SupervisorHandle {
    pub fn mailbox(&self) -> Mailbox<SupervisorMsg> {
        self.mailbox.clone()
    }

    fn tell(&self, msg: SupervisorMsg) {
        if self.mailbox.send(msg).is_err() {
            debug!("supervisor gone, message dropped");
        }
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> SupervisorMsg) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.send(make(tx)).ok()?;
        rx.await.ok()
    }

    pub fn register_listener(&self, fixture_id: impl Into<String>, mailbox: Mailbox<ListenerMsg>) {
        self.tell(SupervisorMsg::RegisterListener { fixture_id: fixture_id.into(), mailbox });
    }

    pub fn unregister_listener(&self, fixture_id: impl Into<String>) {
        self.tell(SupervisorMsg::UnregisterListener(fixture_id.into()));
    }

    pub fn take_snapshot(&self, fixture_id: impl Into<String>) {
        self.tell(SupervisorMsg::TakeSnapshot(fixture_id.into()));
    }

    pub fn restart_listener(&self, fixture_id: impl Into<String>) {
        self.tell(SupervisorMsg::RestartListener(fixture_id.into()));
    }

    pub fn clear_state(&self, fixture_id: impl Into<String>) {
        self.tell(SupervisorMsg::ClearState(fixture_id.into()));
    }

    pub async fn get_sports(&self) -> Vec<SportOverview> {
        self.ask(SupervisorMsg::GetSports).await.unwrap_or_default()
    }

    pub async fn get_sport_detail(&self, code: impl Into<String>) -> Option<SportDetail> {
        let code = code.into();
        self.ask(|tx| SupervisorMsg::GetSportDetail(code, tx)).await.flatten()
    }

    pub async fn get_fixture_detail(&self, fixture_id: impl Into<String>) -> Option<FixtureDetail> {
        let id = fixture_id.into();
        self.ask(|tx| SupervisorMsg::GetFixtureDetail(id, tx)).await.flatten()
    }

    pub async fn get_fixture_history(&self, fixture_id: impl Into<String>) -> Vec<FixtureHistoryEntry> {
        let id = fixture_id.into();
        self.ask(|tx| SupervisorMsg::GetFixtureHistory(id, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn get_fixtures(&self) -> Vec<FixtureOverview> {
        self.ask(SupervisorMsg::GetFixtures).await.unwrap_or_default()
    }

    pub async fn get_adapter_status(&self) -> Option<AdapterStatus> {
        self.ask(SupervisorMsg::GetAdapterStatus).await
    }

    /// Persists and stops the actor; returns once it has.
    pub async fn shutdown(&self) {
        if self.ask(SupervisorMsg::Shutdown).await.is_none() {
            debug!("supervisor already stopped");
        }
    }
}

pub fn spawn_supervisor(
    cfg: SupervisorConfig,
    store: Arc<dyn StateStore>,
    push: Arc<dyn PushNotifier>,
) -> (SupervisorHandle, JoinHandle<()>) {
    let (tx, rx) = mailbox::<SupervisorMsg>();
    let sup = Supervisor::new(cfg, store, push);
    let join = tokio::spawn(sup.run(tx.clone(), rx));
    (SupervisorHandle { mailbox: tx }, join)
}
