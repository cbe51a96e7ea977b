//! Hand-off of events from other execution contexts onto the bus.
//!
//! A dashboard or console reader runs on its own OS thread with its own loop;
//! it must not call into the async bus directly. Instead it holds a
//! [`BridgeSender`] and pushes events into a channel; a [`BridgeReceiver`]
//! task on the bus runtime drains that channel and publishes each event.

use crate::bus::{BusError, EventBus};
use crate::events::Event;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Sending half. Cheap to clone, usable from any thread, never blocks.
#[derive(Debug, Clone)]
pub struct BridgeSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl BridgeSender {
    pub fn send(&self, event: Event) -> Result<(), BusError> {
        self.tx.send(event).map_err(|_| BusError::BridgeClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half, drained on the bus runtime.
#[derive(Debug)]
pub struct BridgeReceiver {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl BridgeReceiver {
    /// Take the next bridged event without publishing it.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Publish every bridged event until all senders are dropped.
    /// Returns the number of events forwarded.
    pub async fn run(mut self, bus: Arc<EventBus>) -> u64 {
        let mut forwarded = 0;
        while let Some(event) = self.rx.recv().await {
            let kind = event.kind();
            if let Err(e) = bus.publish(event).await {
                warn!(kind = %kind, error = %e, "bridged event dispatch failed");
            }
            forwarded += 1;
        }
        debug!(forwarded, "event bridge closed");
        forwarded
    }
}

pub fn bridge() -> (BridgeSender, BridgeReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (BridgeSender { tx }, BridgeReceiver { rx })
}
