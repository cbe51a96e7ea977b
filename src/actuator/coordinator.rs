//! Actuator coordinator: the state machine that owns the hardware link.
//!
//! ```text
//!            request_deploy(non-empty)            request_deploy(*)
//!   ┌──────┐ ───────────────────────▶ ┌──────────┐ ◀──────────────┐
//!   │ Idle │                          │ Deployed │ ───────────────┘ (suppressed)
//!   └──────┘ ◀─────────────────────── └──────────┘
//!               request_retract()
//!                 └─▶ capture_requested
//! ```
//!
//! The active set, the latch and the link sit behind one async mutex. Holding
//! it across a hardware command serializes every command and makes the
//! set/latch pair change atomically.

use super::command::{ActuatorMap, HardwareCommand};
use super::link::{ActuatorLink, LinkError};
use crate::accessory::{self, AccessorySet};
use crate::bus::{handler_fn, EventBus, HandlerError};
use crate::events::{Event, EventKind};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorState {
    Idle,
    Deployed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployOutcome {
    /// Hardware raised the requested accessories and the latch is now set.
    Deployed,
    /// Latch already set for this occupancy; nothing was sent.
    Suppressed,
    /// Nothing needed; a retract-all was sent and the latch left clear.
    RetractedEmpty,
    /// Link unavailable; request discarded.
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetractOutcome {
    Retracted,
    AlreadyIdle,
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorStatus {
    pub state: CoordinatorState,
    pub active: AccessorySet,
    pub latched: bool,
    pub link_open: bool,
    pub commands_sent: u32,
    pub suppressed_requests: u32,
    pub dropped_requests: u32,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub mapping: ActuatorMap,
    /// Physical travel time after every command.
    pub settle: Duration,
    /// Wait after opening the link before the first command.
    pub startup_settle: Duration,
    pub response_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            mapping: ActuatorMap::default(),
            settle: Duration::from_secs(5),
            startup_settle: Duration::from_secs(2),
            response_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("actuator link could not be opened: {0}")]
    ChannelOpen(#[source] LinkError),

    #[error("actuator link could not be closed: {0}")]
    ChannelClose(#[source] LinkError),
}

struct Inner {
    link: Box<dyn ActuatorLink>,
    /// Between `start` and `stop`; a dropped link is only reopened then.
    started: bool,
    active: AccessorySet,
    latched: bool,
    commands_sent: u32,
    suppressed_requests: u32,
    dropped_requests: u32,
}

impl Inner {
    fn reset(&mut self) {
        self.active.clear();
        self.latched = false;
    }

    fn state(&self) -> CoordinatorState {
        if self.latched {
            CoordinatorState::Deployed
        } else {
            CoordinatorState::Idle
        }
    }
}

pub struct ActuatorCoordinator {
    bus: Arc<EventBus>,
    config: CoordinatorConfig,
    inner: Mutex<Inner>,
}

impl ActuatorCoordinator {
    pub fn new(bus: Arc<EventBus>, link: Box<dyn ActuatorLink>, config: CoordinatorConfig) -> Self {
        Self {
            bus,
            config,
            inner: Mutex::new(Inner {
                link,
                started: false,
                active: AccessorySet::new(),
                latched: false,
                commands_sent: 0,
                suppressed_requests: 0,
                dropped_requests: 0,
            }),
        }
    }

    /// Subscribe to accessories-needed (deploy) and presence-left (retract).
    pub fn attach(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.bus.subscribe(
            EventKind::AccessoriesNeeded,
            handler_fn("actuator.deploy", move |event| {
                let coordinator = weak.upgrade();
                async move {
                    if let Some(coordinator) = coordinator {
                        let (needed, unknown) = event.needed_accessories();
                        for entry in unknown {
                            warn!(entry = %entry, "unrecognised accessory in request, dropped");
                        }
                        coordinator.request_deploy(&needed).await;
                    }
                    Ok::<(), HandlerError>(())
                }
            }),
        );

        let weak: Weak<Self> = Arc::downgrade(self);
        self.bus.subscribe(
            EventKind::PresenceLeft,
            handler_fn("actuator.retract", move |_event| {
                let coordinator = weak.upgrade();
                async move {
                    if let Some(coordinator) = coordinator {
                        coordinator.request_retract().await;
                    }
                    Ok::<(), HandlerError>(())
                }
            }),
        );
    }

    /// Open the link, let it settle, and force every actuator down.
    ///
    /// Failing to open the link is the one error that aborts start-up.
    pub async fn start(&self) -> Result<(), CoordinatorError> {
        let mut inner = self.inner.lock().await;

        inner
            .link
            .open()
            .await
            .map_err(CoordinatorError::ChannelOpen)?;
        inner.started = true;
        info!(link = %inner.link.describe(), "actuator coordinator starting");

        tokio::time::sleep(self.config.startup_settle).await;

        if let Err(e) = self.transmit(&mut inner, &HardwareCommand::RetractAll).await {
            warn!(error = %e, "initial retract failed; actuator positions unknown");
        }
        inner.reset();
        Ok(())
    }

    /// Raise the accessories in `needed`, once per occupancy.
    ///
    /// Never fails: an unavailable link drops the request with a diagnostic.
    pub async fn request_deploy(&self, needed: &AccessorySet) -> DeployOutcome {
        let mut inner = self.inner.lock().await;

        if inner.latched {
            inner.suppressed_requests += 1;
            info!(
                requested = %accessory::describe(needed),
                active = %accessory::describe(&inner.active),
                "already deployed for this occupancy, request ignored"
            );
            return DeployOutcome::Suppressed;
        }

        let translation = self.config.mapping.translate(needed);
        for item in &translation.unmapped {
            warn!(accessory = %item, "no actuator mapped, dropped from command");
        }

        let Some(command) = HardwareCommand::deploy(translation.indices.iter().copied()) else {
            // Nothing to raise counts as "everything down", but is not a
            // first signal: the latch stays clear.
            debug!("empty need set, retracting all");
            return match self.transmit(&mut inner, &HardwareCommand::RetractAll).await {
                Ok(()) => DeployOutcome::RetractedEmpty,
                Err(e) => {
                    inner.dropped_requests += 1;
                    warn!(error = %e, "retract for empty need set dropped");
                    DeployOutcome::Dropped
                }
            };
        };

        match self.transmit(&mut inner, &command).await {
            Ok(()) => {
                inner.active = translation.mapped;
                inner.latched = true;
                info!(
                    deployed = %accessory::describe(&inner.active),
                    opcode = %command,
                    "accessories deployed"
                );
                DeployOutcome::Deployed
            }
            Err(e) => {
                inner.dropped_requests += 1;
                warn!(error = %e, opcode = %command, "deploy request dropped");
                DeployOutcome::Dropped
            }
        }
    }

    /// Lower everything and request a capture, if anything is raised.
    pub async fn request_retract(&self) -> RetractOutcome {
        {
            let mut inner = self.inner.lock().await;

            if inner.active.is_empty() {
                debug!("nothing deployed, retract ignored");
                return RetractOutcome::AlreadyIdle;
            }

            if let Err(e) = self.transmit(&mut inner, &HardwareCommand::RetractAll).await {
                inner.dropped_requests += 1;
                warn!(error = %e, "retract dropped; accessories remain deployed");
                return RetractOutcome::Dropped;
            }

            info!(retracted = %accessory::describe(&inner.active), "accessories retracted");
            inner.reset();
        }

        // The lock is released before publishing so capture handlers can
        // query the coordinator.
        if let Err(e) = self
            .bus
            .publish(Event::capture_requested().with_source("actuator"))
            .await
        {
            warn!(error = %e, "capture request dispatch failed");
        }
        RetractOutcome::Retracted
    }

    /// Retract (best effort), send a final retract-all, and close the link.
    /// The link is closed even when the retract commands fail.
    pub async fn stop(&self) -> Result<(), CoordinatorError> {
        let deployed = !self.inner.lock().await.active.is_empty();
        if deployed {
            let outcome = self.request_retract().await;
            debug!(?outcome, "retract before shutdown");
        }

        let mut inner = self.inner.lock().await;
        match self.transmit(&mut inner, &HardwareCommand::RetractAll).await {
            Ok(()) => inner.reset(),
            Err(e) => warn!(error = %e, "final retract failed"),
        }

        inner.started = false;
        let closed = inner.link.close().await;
        info!("actuator coordinator stopped");
        closed.map_err(CoordinatorError::ChannelClose)
    }

    pub async fn status(&self) -> CoordinatorStatus {
        let inner = self.inner.lock().await;
        CoordinatorStatus {
            state: inner.state(),
            active: inner.active.clone(),
            latched: inner.latched,
            link_open: inner.link.is_open(),
            commands_sent: inner.commands_sent,
            suppressed_requests: inner.suppressed_requests,
            dropped_requests: inner.dropped_requests,
        }
    }

    pub async fn state(&self) -> CoordinatorState {
        self.inner.lock().await.state()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Send one command and hold the link for the settle time.
    ///
    /// A link that dropped after `start` gets one reopen attempt per command.
    async fn transmit(&self, inner: &mut Inner, command: &HardwareCommand) -> Result<(), LinkError> {
        if !inner.link.is_open() {
            if !inner.started {
                return Err(LinkError::NotOpen);
            }
            inner.link.open().await?;
            info!(link = %inner.link.describe(), "actuator link reopened");
        }

        let sent_at = Instant::now();
        inner.link.send_line(&command.opcode()).await?;
        inner.commands_sent += 1;
        debug!(opcode = %command, "actuator command sent");

        if let Some(response) = inner.link.read_response(self.config.response_timeout).await {
            debug!(response = %response, "actuator board replied");
        }

        // Response wait counts toward travel time
        let remaining = self.config.settle.saturating_sub(sent_at.elapsed());
        tokio::time::sleep(remaining).await;
        Ok(())
    }
}
