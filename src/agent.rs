//! Top-level orchestrator.
//!
//! Owns the bus and every service, wires their subscriptions, and runs the
//! long-lived loops (presence poll, weather poll, bridge drain) as tokio
//! tasks. Hardware and external programs come in through
//! [`AgentComponents`], so the same agent runs against a serial board or an
//! in-memory link.

use crate::actuator::{
    ActuatorCoordinator, ActuatorLink, CoordinatorError, CoordinatorStatus, SerialLink,
};
use crate::bridge::{self, BridgeReceiver, BridgeSender};
use crate::bus::{BusStats, EventBus};
use crate::capture::{Camera, CaptureService, CommandCamera, NoopAnalyzer, VisionAnalyzer};
use crate::config::Settings;
use crate::presence::{IdleSensor, IioDistanceSensor, PresenceMonitor, PresenceSensor};
use crate::weather::{
    CommandWeatherSource, StaticWeatherSource, WeatherMetrics, WeatherService, WeatherSource,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent has already been started")]
    AlreadyRunning,

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// External collaborators the agent drives.
pub struct AgentComponents {
    pub link: Box<dyn ActuatorLink>,
    pub sensor: Box<dyn PresenceSensor>,
    pub weather_source: Arc<dyn WeatherSource>,
    /// No capture service is wired when `None`.
    pub camera: Option<Arc<dyn Camera>>,
    pub analyzer: Arc<dyn VisionAnalyzer>,
}

impl AgentComponents {
    /// Real hardware as described by `settings`.
    pub fn from_settings(settings: &Settings) -> Self {
        let link = SerialLink::new(&settings.serial.port, settings.serial.baud_rate);

        let sensor: Box<dyn PresenceSensor> = match &settings.presence.sensor_path {
            Some(path) => Box::new(IioDistanceSensor::new(path)),
            None => {
                warn!("no presence sensor configured; presence only arrives through the bridge");
                Box::new(IdleSensor)
            }
        };

        let weather_source: Arc<dyn WeatherSource> =
            match CommandWeatherSource::from_argv(&settings.weather.source_command) {
                Some(source) => Arc::new(source),
                None => Arc::new(StaticWeatherSource::new(
                    settings.weather.static_metrics.clone(),
                )),
            };

        let camera = if settings.camera.enabled {
            CommandCamera::from_argv(&settings.camera.command, &settings.camera.output_dir)
                .map(|camera| Arc::new(camera) as Arc<dyn Camera>)
        } else {
            None
        };

        Self {
            link: Box::new(link),
            sensor,
            weather_source,
            camera,
            analyzer: Arc::new(NoopAnalyzer),
        }
    }

    pub fn with_link(mut self, link: Box<dyn ActuatorLink>) -> Self {
        self.link = link;
        self
    }

    pub fn with_weather(mut self, metrics: WeatherMetrics) -> Self {
        self.weather_source = Arc::new(StaticWeatherSource::new(metrics));
        self
    }

    pub fn without_camera(mut self) -> Self {
        self.camera = None;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub running: bool,
    pub uptime_seconds: u64,
    pub weather_evaluations: u64,
    pub captures: u64,
    pub bus: BusStats,
    pub coordinator: CoordinatorStatus,
}

pub struct ClosetAgent {
    bus: Arc<EventBus>,
    coordinator: Arc<ActuatorCoordinator>,
    weather: Arc<WeatherService>,
    capture: Option<Arc<CaptureService>>,
    presence: Option<PresenceMonitor>,
    bridge_tx: BridgeSender,
    bridge_rx: Option<BridgeReceiver>,
    weather_interval: Duration,
    tasks: Vec<JoinHandle<()>>,
    running: bool,
    start_time: Instant,
}

impl ClosetAgent {
    pub fn new(settings: &Settings, components: AgentComponents) -> Self {
        let bus = Arc::new(EventBus::new());

        let coordinator = Arc::new(ActuatorCoordinator::new(
            Arc::clone(&bus),
            components.link,
            settings.coordinator_config(),
        ));
        let weather = Arc::new(WeatherService::new(
            Arc::clone(&bus),
            components.weather_source,
            settings.weather.thresholds.clone(),
        ));
        let capture = components.camera.map(|camera| {
            Arc::new(CaptureService::new(
                Arc::clone(&bus),
                camera,
                components.analyzer,
            ))
        });
        let presence = PresenceMonitor::new(
            Arc::clone(&bus),
            components.sensor,
            settings.presence_config(),
        );
        let (bridge_tx, bridge_rx) = bridge::bridge();

        Self {
            bus,
            coordinator,
            weather,
            capture,
            presence: Some(presence),
            bridge_tx,
            bridge_rx: Some(bridge_rx),
            weather_interval: settings.weather_interval(),
            tasks: Vec::new(),
            running: false,
            start_time: Instant::now(),
        }
    }

    /// Open the hardware link, wire subscriptions, and spawn the loops.
    ///
    /// Fails only when the actuator link cannot be opened.
    pub async fn start(&mut self) -> Result<(), AgentError> {
        if self.running {
            return Err(AgentError::AlreadyRunning);
        }
        let (Some(presence), Some(bridge_rx)) = (self.presence.take(), self.bridge_rx.take()) else {
            return Err(AgentError::AlreadyRunning);
        };

        if let Err(e) = self.coordinator.start().await {
            // Keep the loops so a later start can retry
            self.presence = Some(presence);
            self.bridge_rx = Some(bridge_rx);
            return Err(e.into());
        }

        self.coordinator.attach();
        self.weather.attach();
        if let Some(capture) = &self.capture {
            capture.attach();
        }

        let bus = Arc::clone(&self.bus);
        self.tasks.push(tokio::spawn(async move {
            let forwarded = bridge_rx.run(bus).await;
            debug!(forwarded, "bridge task finished");
        }));
        self.tasks.push(tokio::spawn(presence.run()));
        self.tasks.push(tokio::spawn(
            Arc::clone(&self.weather).run(self.weather_interval),
        ));

        self.running = true;
        self.start_time = Instant::now();
        info!(
            capture = self.capture.is_some(),
            weather_interval_s = self.weather_interval.as_secs(),
            "smart closet running"
        );
        Ok(())
    }

    /// Stop the loops, lower everything, and release the link.
    pub async fn shutdown(&mut self) -> Result<(), AgentError> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if !self.running {
            debug!("shutdown on an agent that never started");
            return Ok(());
        }
        self.running = false;
        self.coordinator.stop().await?;
        info!("smart closet stopped");
        Ok(())
    }

    /// Sender for events coming from other threads (console, dashboard).
    pub fn bridge(&self) -> BridgeSender {
        self.bridge_tx.clone()
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn coordinator(&self) -> &Arc<ActuatorCoordinator> {
        &self.coordinator
    }

    pub fn weather(&self) -> &Arc<WeatherService> {
        &self.weather
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub async fn get_state(&self) -> AgentState {
        AgentState {
            running: self.running,
            uptime_seconds: if self.running {
                self.start_time.elapsed().as_secs()
            } else {
                0
            },
            weather_evaluations: self.weather.evaluations(),
            captures: self.capture.as_ref().map_or(0, |c| c.captures()),
            bus: self.bus.stats(),
            coordinator: self.coordinator.status().await,
        }
    }
}
