pub mod command;
pub mod coordinator;
pub mod link;

pub use command::{ActuatorMap, HardwareCommand, Translation};
pub use coordinator::{
    ActuatorCoordinator, CoordinatorConfig, CoordinatorError, CoordinatorState,
    CoordinatorStatus, DeployOutcome, RetractOutcome,
};
pub use link::{ActuatorLink, Endpoint, LinkError, LinkProbe, RecordingLink, SerialLink};
