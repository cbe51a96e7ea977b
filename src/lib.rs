//! # Smart Closet
//!
//! Event-driven coordination core for a closet that raises the accessories
//! a person needs for today's weather as they walk up, lowers them again
//! once they leave, and takes a picture afterwards.
//!
//! ## Features
//!
//! - **Event bus**: typed publish/subscribe with concurrent fan-out and
//!   aggregated handler failures
//! - **Weather decisions**: threshold rules over loosely typed readings
//! - **Actuator coordination**: one deployment per occupancy, serialized
//!   hardware commands with settle time, retract on departure
//! - **Capture triggering**: a capture request after every retract
//! - **Late-bound configuration**: actuator mapping, thresholds and timings
//!   from YAML and `CLOSET_*` environment variables
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use smartcloset::{AgentComponents, ClosetAgent, RecordingLink, Settings};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load(None)?;
//! let components = AgentComponents::from_settings(&settings)
//!     .with_link(Box::new(RecordingLink::new()));
//!
//! let mut agent = ClosetAgent::new(&settings, components);
//! agent.start().await?;
//! agent.bridge().send(smartcloset::Event::presence_arrived(None))?;
//! agent.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`bus`] - Event bus and handler contract
//! - [`bridge`] - Hand-off from other threads onto the bus
//! - [`weather`] - Accessory rules and the weather service
//! - [`actuator`] - Hardware commands, links and the coordinator
//! - [`presence`] - Distance sensor debouncing
//! - [`capture`] - Camera and analysis after a retract
//! - [`config`] - Settings loading and validation
//! - [`agent`] - Wires everything together

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod accessory;
pub mod actuator;
pub mod agent;
pub mod bridge;
pub mod bus;
pub mod capture;
pub mod config;
pub mod events;
pub mod presence;
pub mod weather;

// Re-export main public types for convenience
pub use accessory::{Accessory, AccessorySet};
pub use actuator::{
    ActuatorCoordinator, ActuatorLink, ActuatorMap, CoordinatorConfig, CoordinatorState,
    DeployOutcome, HardwareCommand, RecordingLink, RetractOutcome, SerialLink,
};
pub use agent::{AgentComponents, ClosetAgent};
pub use bus::{handler_fn, BusError, EventBus, EventHandler, SharedEventBus};
pub use config::Settings;
pub use events::{Event, EventKind};
pub use weather::{evaluate, WeatherMetrics, WeatherThresholds};
