// ===============================
// src/adapter.rs
// ===============================
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{ListenerConfig, SupervisorConfig};
use crate::domain::SuspensionReason;
use crate::facade::ResourceFacade;
use crate::listener::{spawn_listener, ListenerHandle, ListenerMsg, ListenerStatus};
use crate::market_states::MarketStatesSnapshot;
use crate::plugin::PluginConsumer;
use crate::push::PushNotifier;
use crate::store::StateStore;
use crate::supervisor::{spawn_supervisor, SupervisorHandle};

/// Owns the supervisor and one listener per fixture.
pub struct Adapter {
    supervisor: SupervisorHandle,
    supervisor_join: JoinHandle<()>,
    plugin: Arc<dyn PluginConsumer>,
    listener_cfg: ListenerConfig,
    listeners: HashMap<String, ListenerHandle>,
}

impl Adapter {
    pub fn start(
        listener_cfg: ListenerConfig,
        supervisor_cfg: SupervisorConfig,
        store: Arc<dyn StateStore>,
        push: Arc<dyn PushNotifier>,
        plugin: Arc<dyn PluginConsumer>,
    ) -> Self {
        let (supervisor, supervisor_join) = spawn_supervisor(supervisor_cfg, store, push);
        Self {
            supervisor,
            supervisor_join,
            plugin,
            listener_cfg,
            listeners: HashMap::new(),
        }
    }

    pub fn supervisor(&self) -> &SupervisorHandle {
        &self.supervisor
    }

    pub fn fixture_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.listeners.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Spawns and registers a listener. False if one is already running for
    /// that fixture.
    pub fn add_fixture(&mut self, facade: Arc<dyn ResourceFacade>) -> bool {
        let id = facade.fixture_id().to_string();
        if let Some(existing) = self.listeners.get(&id) {
            if !existing.is_finished() {
                warn!(fixture_id = %id, "listener already running");
                return false;
            }
        }

        let handle = spawn_listener(
            facade,
            self.plugin.clone(),
            self.supervisor.mailbox(),
            self.listener_cfg.clone(),
        );
        self.supervisor.register_listener(id.clone(), handle.mailbox());
        info!(fixture_id = %id, sport = %handle.sport(), "fixture added");
        self.listeners.insert(id, handle);
        true
    }

    /// Stops the listener and waits for it. False for an unknown fixture.
    pub async fn remove_fixture(&mut self, fixture_id: &str) -> bool {
        let Some(handle) = self.listeners.remove(fixture_id) else {
            return false;
        };
        handle.stop();
        self.supervisor.unregister_listener(fixture_id);
        handle.join().await;
        info!(%fixture_id, "fixture removed");
        true
    }

    pub async fn fixture_markets(&self, fixture_id: &str) -> Option<MarketStatesSnapshot> {
        self.listeners.get(fixture_id)?.markets().await
    }

    pub async fn fixture_status(&self, fixture_id: &str) -> Option<ListenerStatus> {
        self.listeners.get(fixture_id)?.status().await
    }

    pub fn suspend_fixture(&self, fixture_id: &str, reason: SuspensionReason) -> bool {
        self.listeners
            .get(fixture_id)
            .map_or(false, |h| h.send(ListenerMsg::Suspend(reason)))
    }

    pub fn unsuspend_fixture(&self, fixture_id: &str) -> bool {
        self.listeners
            .get(fixture_id)
            .map_or(false, |h| h.send(ListenerMsg::UnSuspend))
    }

    /// Stops every listener, then the supervisor (which persists on exit).
    pub async fn shutdown(mut self) {
        info!(listeners = self.listeners.len(), "adapter shutting down");
        for h in self.listeners.values() {
            h.stop();
        }
        for (_, h) in self.listeners.drain() {
            h.join().await;
        }
        self.supervisor.shutdown().await;
        if let Err(e) = self.supervisor_join.await {
            error!(?e, "supervisor task failed");
        }
    }
}
