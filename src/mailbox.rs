// ===============================
// src/mailbox.rs
// ===============================
//
// Two-band actor mailbox: band 0 (control) is always drained before band 1
// (housekeeping). Arrival order is kept within a band. Both queues are
// unbounded so senders never wait on a slow actor.
//
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Control,
    Housekeeping,
}

/// Implemented by every actor message type to pick its band.
pub trait Prioritized {
    fn band(&self) -> Band;
}

#[derive(Debug, Error)]
#[error("mailbox closed")]
pub struct MailboxClosed<M>(pub M);

#[derive(Debug)]
pub struct Mailbox<M> {
    control: mpsc::UnboundedSender<M>,
    housekeeping: mpsc::UnboundedSender<M>,
}

// derive(Clone) would demand M: Clone
impl<M> Clone for Mailbox<M> {
    fn clone(&self) -> Self {
        Self {
            control: self.control.clone(),
            housekeeping: self.housekeeping.clone(),
        }
    }
}

#[derive(Debug)]
pub struct MailboxReceiver<M> {
    control: mpsc::UnboundedReceiver<M>,
    housekeeping: mpsc::UnboundedReceiver<M>,
}

pub fn mailbox<M>() -> (Mailbox<M>, MailboxReceiver<M>) {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (housekeeping_tx, housekeeping_rx) = mpsc::unbounded_channel();
    (
        Mailbox { control: control_tx, housekeeping: housekeeping_tx },
        MailboxReceiver { control: control_rx, housekeeping: housekeeping_rx },
    )
}

impl<M: Prioritized> Mailbox<M> {
    pub fn send(&self, msg: M) -> Result<(), MailboxClosed<M>> {
        let tx = match msg.band() {
            Band::Control => &self.control,
            Band::Housekeeping => &self.housekeeping,
        };
        tx.send(msg).map_err(|e| MailboxClosed(e.0))
    }

    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }
}

impl<M> MailboxReceiver<M> {
    /// Next message, control band first. None once every sender is gone and
    /// both queues are empty.
    pub async fn recv(&mut self) -> Option<M> {
        tokio::select! {
            biased;

            Some(msg) = self.control.recv() => Some(msg),
            Some(msg) = self.housekeeping.recv() => Some(msg),
            else => None,
        }
    }

    /// Non-blocking variant used when draining.
    pub fn try_recv(&mut self) -> Option<M> {
        self.control
            .try_recv()
            .ok()
            .or_else(|| self.housekeeping.try_recv().ok())
    }
}

/// Posts `make()` into `mailbox` every `every` (first post after one period).
/// Ends on its own once the actor's receiver is gone.
pub fn spawn_ticker<M, F>(mailbox: Mailbox<M>, every: Duration, make: F) -> JoinHandle<()>
where
    M: Prioritized + Send + 'static,
    F: Fn() -> M + Send + 'static,
{
    tokio::spawn(async move {
        let mut tick = interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // tick pertama langsung selesai
        tick.tick().await;
        loop {
            tick.tick().await;
            if mailbox.send(make()).is_err() {
                break;
            }
        }
    })
}
