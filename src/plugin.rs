// ===============================
// src/plugin.rs
// ===============================
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::domain::{now_ns, Event, Fixture, SuspensionReason};

/// Downstream consumer of validated fixture data. Errors are opaque to the
/// listener: it logs them, counts them and keeps going.
#[async_trait]
pub trait PluginConsumer: Send + Sync {
    async fn process_snapshot(&self, fixture: &Fixture, epoch_changed: bool) -> anyhow::Result<()>;
    /// `fixture` only carries the markets that actually changed.
    async fn process_stream_update(&self, fixture: &Fixture, epoch_changed: bool) -> anyhow::Result<()>;
    async fn process_match_status(&self, fixture: &Fixture) -> anyhow::Result<()>;
    async fn process_fixture_deletion(&self, fixture: &Fixture) -> anyhow::Result<()>;
    async fn suspend(&self, fixture_id: &str, reason: SuspensionReason) -> anyhow::Result<()>;
    async fn unsuspend(&self, fixture: &Fixture) -> anyhow::Result<()>;
}

/// Logs every callback; optionally forwards an Event to the JSONL recorder.
#[derive(Clone, Default)]
pub struct LoggingPlugin {
    rec_tx: Option<mpsc::Sender<Event>>,
}

impl LoggingPlugin {
    pub fn new(rec_tx: Option<mpsc::Sender<Event>>) -> Self {
        Self { rec_tx }
    }

    fn record(&self, ev: Event) {
        if let Some(tx) = &self.rec_tx {
            // recorder lambat -> buang event, jangan tahan listener
            if tx.try_send(ev).is_err() {
                warn!("recorder channel full or closed, event dropped");
            }
        }
    }
}

#[async_trait]
impl PluginConsumer for LoggingPlugin {
    async fn process_snapshot(&self, fixture: &Fixture, epoch_changed: bool) -> anyhow::Result<()> {
        info!(
            fixture_id = %fixture.id,
            sequence = fixture.sequence,
            epoch = fixture.epoch,
            markets = fixture.markets.len(),
            epoch_changed,
            "SNAPSHOT"
        );
        self.record(Event::Snapshot { ts_ns: now_ns(), fixture: fixture.clone(), epoch_changed });
        Ok(())
    }

    async fn process_stream_update(&self, fixture: &Fixture, epoch_changed: bool) -> anyhow::Result<()> {
        info!(
            fixture_id = %fixture.id,
            sequence = fixture.sequence,
            changed = fixture.markets.len(),
            "DELTA"
        );
        self.record(Event::Delta { ts_ns: now_ns(), fixture: fixture.clone(), epoch_changed });
        Ok(())
    }

    async fn process_match_status(&self, fixture: &Fixture) -> anyhow::Result<()> {
        let status = fixture.match_status.map(|s| s.as_str()).unwrap_or("unknown");
        info!(fixture_id = %fixture.id, %status, "MATCH_STATUS");
        self.record(Event::MatchStatus {
            ts_ns: now_ns(),
            fixture_id: fixture.id.clone(),
            status: fixture.match_status,
        });
        Ok(())
    }

    async fn process_fixture_deletion(&self, fixture: &Fixture) -> anyhow::Result<()> {
        warn!(fixture_id = %fixture.id, "DELETED");
        self.record(Event::Deletion { ts_ns: now_ns(), fixture_id: fixture.id.clone() });
        Ok(())
    }

    async fn suspend(&self, fixture_id: &str, reason: SuspensionReason) -> anyhow::Result<()> {
        warn!(%fixture_id, reason = reason.as_str(), "SUSPEND");
        self.record(Event::Suspend { ts_ns: now_ns(), fixture_id: fixture_id.to_string(), reason });
        Ok(())
    }

    async fn unsuspend(&self, fixture: &Fixture) -> anyhow::Result<()> {
        info!(fixture_id = %fixture.id, "UNSUSPEND");
        self.record(Event::UnSuspend { ts_ns: now_ns(), fixture_id: fixture.id.clone() });
        Ok(())
    }
}
