// ===============================
// src/push.rs
// ===============================
//
// Push-notification boundary + in-process group hub.
// Groups: "sport:{code}" and "fixture:{id}". A connection is just an
// unbounded channel; if its receiver is gone it is pruned on the next publish.
//
use std::collections::HashSet;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::overview::{FixtureOverview, Overview, SportOverview};

pub type ConnectionId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub group: String,
    pub overview: Overview,
}

pub fn sport_group(code: &str) -> String {
    format!("sport:{code}")
}

pub fn fixture_group(id: &str) -> String {
    format!("fixture:{id}")
}

#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn publish_sport_update(&self, sport: &SportOverview);
    async fn publish_fixture_update(&self, fixture: &FixtureOverview);
    async fn join_sport_group(&self, conn: ConnectionId, sport: &str);
    async fn leave_sport_group(&self, conn: ConnectionId, sport: &str);
    async fn join_fixture_group(&self, conn: ConnectionId, fixture_id: &str);
    async fn leave_fixture_group(&self, conn: ConnectionId, fixture_id: &str);
}

#[derive(Default)]
struct HubInner {
    next_id: ConnectionId,
    conns: HashMap<ConnectionId, mpsc::UnboundedSender<Notification>>,
    groups: HashMap<String, HashSet<ConnectionId>>,
}

impl HubInner {
    fn drop_conn(&mut self, id: ConnectionId) {
        self.conns.remove(&id);
        for members in self.groups.values_mut() {
            members.remove(&id);
        }
        self.groups.retain(|_, m| !m.is_empty());
    }
}

#[derive(Default)]
pub struct GroupHub {
    inner: Mutex<HubInner>,
}

impl GroupHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut g = self.inner.lock();
        g.next_id += 1;
        let id = g.next_id;
        g.conns.insert(id, tx);
        debug!(conn = id, "push: connected");
        (id, rx)
    }

    /// Leaves every group.
    pub fn disconnect(&self, conn: ConnectionId) {
        self.inner.lock().drop_conn(conn);
        debug!(conn, "push: disconnected");
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().conns.len()
    }

    pub fn group_size(&self, group: &str) -> usize {
        self.inner.lock().groups.get(group).map_or(0, |m| m.len())
    }

    fn join(&self, conn: ConnectionId, group: String) {
        let mut g = self.inner.lock();
        if !g.conns.contains_key(&conn) {
            debug!(conn, %group, "push: join for unknown connection ignored");
            return;
        }
        g.groups.entry(group).or_default().insert(conn);
    }

    fn leave(&self, conn: ConnectionId, group: &str) {
        let mut g = self.inner.lock();
        if let Some(members) = g.groups.get_mut(group) {
            members.remove(&conn);
            if members.is_empty() {
                g.groups.remove(group);
            }
        }
    }

    /// Returns the number of connections reached.
    pub fn publish(&self, group: &str, overview: Overview) -> usize {
        let mut g = self.inner.lock();
        let Some(members) = g.groups.get(group) else {
            return 0;
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for id in members.iter() {
            let sent = g.conns.get(id).map(|tx| {
                tx.send(Notification { group: group.to_string(), overview: overview.clone() })
                    .is_ok()
            });
            match sent {
                Some(true) => delivered += 1,
                _ => dead.push(*id),
            }
        }
        for id in dead {
            debug!(conn = id, "push: pruning dead connection");
            g.drop_conn(id);
        }
        delivered
    }
}

#[async_trait]
impl PushNotifier for GroupHub {
    async fn publish_sport_update(&self, sport: &SportOverview) {
        let n = self.publish(&sport_group(&sport.name), Overview::Sport(sport.clone()));
        debug!(sport = %sport.name, delivered = n, "push: sport update");
    }

    async fn publish_fixture_update(&self, fixture: &FixtureOverview) {
        let n = self.publish(&fixture_group(&fixture.id), Overview::Fixture(fixture.clone()));
        debug!(fixture_id = %fixture.id, delivered = n, "push: fixture update");
    }

    async fn join_sport_group(&self, conn: ConnectionId, sport: &str) {
        self.join(conn, sport_group(sport));
    }

    async fn leave_sport_group(&self, conn: ConnectionId, sport: &str) {
        self.leave(conn, &sport_group(sport));
    }

    async fn join_fixture_group(&self, conn: ConnectionId, fixture_id: &str) {
        self.join(conn, fixture_group(fixture_id));
    }

    async fn leave_fixture_group(&self, conn: ConnectionId, fixture_id: &str) {
        self.leave(conn, &fixture_group(fixture_id));
    }
}
