//! Presence monitoring.
//!
//! A distance sensor is sampled on a short interval. Someone is considered
//! present after `stable_count` consecutive in-range readings, and gone once
//! no in-range reading has been seen for `absence_timeout`. Only transitions
//! are published.

use crate::bus::EventBus;
use crate::events::Event;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// Usable range of the ultrasonic sensor; anything outside is noise.
const MIN_VALID_DISTANCE_CM: f32 = 2.0;
const MAX_VALID_DISTANCE_CM: f32 = 400.0;

/// Distance sensor driver. `None` means no usable reading this time.
#[async_trait]
pub trait PresenceSensor: Send {
    async fn sample(&mut self) -> Option<f32>;
}

/// Sensor that never sees anyone. Stands in when no hardware is attached.
#[derive(Debug, Default)]
pub struct IdleSensor;

#[async_trait]
impl PresenceSensor for IdleSensor {
    async fn sample(&mut self) -> Option<f32> {
        None
    }
}

/// Reads an IIO distance attribute (millimetres), as exposed by the kernel
/// `srf04` driver.
#[derive(Debug, Clone)]
pub struct IioDistanceSensor {
    path: PathBuf,
}

impl IioDistanceSensor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PresenceSensor for IioDistanceSensor {
    async fn sample(&mut self) -> Option<f32> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw.trim().parse::<f32>().ok().map(|mm| mm / 10.0),
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "distance read failed");
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub detection_distance_cm: f32,
    pub stable_count: u32,
    pub absence_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            detection_distance_cm: 120.0,
            stable_count: 3,
            absence_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PresenceTransition {
    Arrived { distance_cm: f32 },
    Left { absent_for: Duration },
}

/// Debounces raw distance samples into arrive/leave transitions.
#[derive(Debug, Clone)]
pub struct PresenceDetector {
    config: PresenceConfig,
    present: bool,
    consecutive: u32,
    last_detection: Option<Instant>,
}

impl PresenceDetector {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            config,
            present: false,
            consecutive: 0,
            last_detection: None,
        }
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    /// Feed one sample taken at `now`.
    pub fn observe(&mut self, sample: Option<f32>, now: Instant) -> Option<PresenceTransition> {
        let distance = sample.filter(|d| (MIN_VALID_DISTANCE_CM..=MAX_VALID_DISTANCE_CM).contains(d));

        match distance {
            Some(d) if d <= self.config.detection_distance_cm => {
                self.consecutive = self.consecutive.saturating_add(1);
                self.last_detection = Some(now);

                if !self.present && self.consecutive >= self.config.stable_count {
                    self.present = true;
                    return Some(PresenceTransition::Arrived { distance_cm: d });
                }
                None
            }
            // Out of range or no reading: both count toward absence
            _ => {
                self.consecutive = 0;
                self.check_absence(now)
            }
        }
    }

    fn check_absence(&mut self, now: Instant) -> Option<PresenceTransition> {
        if !self.present {
            return None;
        }
        let last = self.last_detection?;
        let absent_for = now.saturating_duration_since(last);
        if absent_for < self.config.absence_timeout {
            return None;
        }

        self.present = false;
        self.last_detection = None;
        Some(PresenceTransition::Left { absent_for })
    }
}

/// Poll loop publishing presence transitions on the bus.
pub struct PresenceMonitor {
    bus: Arc<EventBus>,
    sensor: Box<dyn PresenceSensor>,
    detector: PresenceDetector,
    poll_interval: Duration,
}

impl PresenceMonitor {
    pub fn new(bus: Arc<EventBus>, sensor: Box<dyn PresenceSensor>, config: PresenceConfig) -> Self {
        let poll_interval = config.poll_interval;
        Self {
            bus,
            sensor,
            detector: PresenceDetector::new(config),
            poll_interval,
        }
    }

    /// Take one sample and publish the resulting transition, if any.
    pub async fn step(&mut self) -> Option<PresenceTransition> {
        let sample = self.sensor.sample().await;
        let transition = self.detector.observe(sample, Instant::now())?;

        let event = match transition {
            PresenceTransition::Arrived { distance_cm } => {
                info!(distance_cm, "person arrived");
                Event::presence_arrived(Some(distance_cm))
            }
            PresenceTransition::Left { absent_for } => {
                info!(absent_s = absent_for.as_secs(), "person left");
                Event::presence_left(Some(absent_for))
            }
        };

        if let Err(e) = self.bus.publish(event.with_source("presence")).await {
            warn!(error = %e, "presence event dispatch failed");
        }
        Some(transition)
    }

    pub async fn run(mut self) {
        info!(interval_ms = self.poll_interval.as_millis() as u64, "presence monitoring started");
        loop {
            self.step().await;
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub fn is_present(&self) -> bool {
        self.detector.is_present()
    }
}
