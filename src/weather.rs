//! Weather evaluation: which accessories does today's weather call for.
//!
//! The fetch itself is an external collaborator behind [`WeatherSource`];
//! this module owns the decision logic in [`evaluate`] and the service that
//! wires it to the bus.

use crate::accessory::{self, Accessory, AccessorySet};
use crate::bus::{handler_fn, BusError, EventBus, HandlerError};
use crate::events::{Event, EventKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

// Unit suffixes appended by the upstream fetcher ("25°C", "80%", "0mm")
const UNIT_SUFFIXES: [&str; 4] = ["°C", "℃", "%", "mm"];

/// Snapshot of weather readings as delivered by the fetcher.
///
/// Values are kept as the loosely-typed strings the fetcher produced;
/// [`evaluate`] decides per rule whether a value is usable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherMetrics {
    pub current_temp: Option<String>,
    pub precipitation: Option<String>,
    pub uv_index: Option<String>,
    pub dust: Option<String>,
    pub humidity: Option<String>,
}

impl WeatherMetrics {
    /// Build from a key/value mapping, ignoring keys it does not know.
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let get = |key: &str| map.get(key).cloned();
        Self {
            current_temp: get("current_temp"),
            precipitation: get("precipitation"),
            uv_index: get("uv_index"),
            dust: get("dust"),
            humidity: get("humidity"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherThresholds {
    /// Precipitation probability (%) at or above which the umbrella is raised.
    pub precipitation: f64,
    /// UV index at or above which sun protection is raised.
    pub uv_index: f64,
    /// Particulate ratings that call for a mask.
    pub bad_dust: Vec<String>,
    /// Temperature (°C) at or below which warmth is raised.
    pub cold_temp: f64,
}

impl Default for WeatherThresholds {
    fn default() -> Self {
        Self {
            precipitation: 20.0,
            uv_index: 3.0,
            bad_dust: vec!["나쁨".to_string(), "매우 나쁨".to_string()],
            cold_temp: 10.0,
        }
    }
}

/// Read a numeric metric, tolerating a trailing unit. Returns `None` for
/// anything that is not a finite number.
pub fn parse_reading(raw: Option<&str>) -> Option<f64> {
    let mut text = raw?.trim();
    for suffix in UNIT_SUFFIXES {
        if let Some(stripped) = text.strip_suffix(suffix) {
            text = stripped.trim_end();
            break;
        }
    }
    text.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn reading(name: &'static str, raw: Option<&String>) -> Option<f64> {
    let value = parse_reading(raw.map(String::as_str));
    if value.is_none() {
        debug!(metric = name, raw = ?raw, "unreadable metric, rule skipped");
    }
    value
}

/// Map a weather snapshot to the accessories it calls for.
///
/// Each rule is evaluated on its own. A missing or malformed metric only
/// disables the rule that reads it.
pub fn evaluate(metrics: &WeatherMetrics, thresholds: &WeatherThresholds) -> AccessorySet {
    let mut needed = AccessorySet::new();

    if let Some(pop) = reading("precipitation", metrics.precipitation.as_ref()) {
        if pop >= thresholds.precipitation {
            needed.insert(Accessory::Umbrella);
        }
    }

    if let Some(uv) = reading("uv_index", metrics.uv_index.as_ref()) {
        if uv >= thresholds.uv_index {
            needed.insert(Accessory::SunProtection);
        }
    }

    if let Some(dust) = metrics.dust.as_deref().map(str::trim) {
        if thresholds.bad_dust.iter().any(|bad| bad.trim() == dust) {
            needed.insert(Accessory::Mask);
        }
    }

    if let Some(temp) = reading("current_temp", metrics.current_temp.as_ref()) {
        if temp <= thresholds.cold_temp {
            needed.insert(Accessory::Warmth);
        }
    }

    needed
}

#[derive(Debug, Error)]
pub enum WeatherError {
    #[error("weather fetch failed: {0}")]
    Fetch(String),

    #[error("weather source returned unreadable data: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Dispatch(#[from] BusError),
}

/// External weather fetcher.
#[async_trait]
pub trait WeatherSource: Send + Sync {
    async fn fetch(&self) -> Result<WeatherMetrics, WeatherError>;
}

/// Always returns the same snapshot.
#[derive(Debug, Clone)]
pub struct StaticWeatherSource {
    metrics: WeatherMetrics,
}

impl StaticWeatherSource {
    pub fn new(metrics: WeatherMetrics) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl WeatherSource for StaticWeatherSource {
    async fn fetch(&self) -> Result<WeatherMetrics, WeatherError> {
        Ok(self.metrics.clone())
    }
}

/// Runs an external fetcher program that prints a JSON metrics object.
#[derive(Debug, Clone)]
pub struct CommandWeatherSource {
    program: String,
    args: Vec<String>,
}

impl CommandWeatherSource {
    /// `argv[0]` is the program; `None` if `argv` is empty.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl WeatherSource for CommandWeatherSource {
    async fn fetch(&self) -> Result<WeatherMetrics, WeatherError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .await
            .map_err(|e| WeatherError::Fetch(format!("{}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(WeatherError::Fetch(format!(
                "{} exited with {}",
                self.program, output.status
            )));
        }

        let raw: HashMap<String, serde_json::Value> = serde_json::from_slice(&output.stdout)?;
        // Fetchers emit numbers or strings; keep both as text.
        let map = raw
            .into_iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect();
        Ok(WeatherMetrics::from_map(&map))
    }
}

/// Fetches weather on presence and on a timer, then publishes the need set.
pub struct WeatherService {
    bus: Arc<EventBus>,
    source: Arc<dyn WeatherSource>,
    thresholds: WeatherThresholds,
    last_metrics: Mutex<Option<WeatherMetrics>>,
    evaluations: AtomicU64,
}

impl WeatherService {
    pub fn new(
        bus: Arc<EventBus>,
        source: Arc<dyn WeatherSource>,
        thresholds: WeatherThresholds,
    ) -> Self {
        Self {
            bus,
            source,
            thresholds,
            last_metrics: Mutex::new(None),
            evaluations: AtomicU64::new(0),
        }
    }

    /// Re-evaluate whenever someone arrives.
    pub fn attach(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.bus.subscribe(
            EventKind::PresenceArrived,
            handler_fn("weather.on_arrival", move |_event| {
                let service = weak.upgrade();
                async move {
                    match service {
                        Some(service) => service
                            .refresh()
                            .await
                            .map(|_| ())
                            .map_err(HandlerError::from),
                        None => Ok(()),
                    }
                }
            }),
        );
    }

    /// Fetch, evaluate and publish. The returned set is what was published.
    pub async fn refresh(&self) -> Result<AccessorySet, WeatherError> {
        let metrics = self.source.fetch().await?;
        info!(
            temp = ?metrics.current_temp,
            precipitation = ?metrics.precipitation,
            uv = ?metrics.uv_index,
            dust = ?metrics.dust,
            humidity = ?metrics.humidity,
            "weather updated"
        );

        *self
            .last_metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(metrics.clone());

        let needed = evaluate(&metrics, &self.thresholds);
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        info!(needed = %accessory::describe(&needed), "accessories evaluated");

        // The need set goes out even when a weather-updated subscriber fails
        let updated = self
            .bus
            .publish(Event::weather_updated(&metrics).with_source("weather"))
            .await;
        if let Err(e) = &updated {
            warn!(error = %e, "weather-updated dispatch failed");
        }
        self.bus
            .publish(Event::accessories_needed(&needed).with_source("weather"))
            .await?;
        updated?;
        Ok(needed)
    }

    /// Periodic refresh loop. Runs until the task is aborted.
    ///
    /// The first tick lands one full interval after start, so nothing is
    /// raised at boot; arrivals refresh on their own.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let first = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(first, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.refresh().await {
                warn!(error = %e, "periodic weather refresh failed");
            }
        }
    }

    pub fn last_metrics(&self) -> Option<WeatherMetrics> {
        self.last_metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn evaluations(&self) -> u64 {
        self.evaluations.load(Ordering::Relaxed)
    }

    pub fn thresholds(&self) -> &WeatherThresholds {
        &self.thresholds
    }
}
