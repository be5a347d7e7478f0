// Printfarm - Live status aggregation for a fleet of 3D printers

pub mod driver;
pub mod engine;
pub mod hub;
pub mod registry;
pub mod server;
pub mod status;

pub use driver::{DriverError, PrinterDriver};
pub use engine::{BroadcastRecord, EngineConfig, EngineHandle, ServerMessage, StatusEngine};
pub use hub::{SubscriberHub, UpdateSink};
pub use registry::{DeviceConfig, DeviceRegistry};
pub use server::{ServerConfig, ServerState};
pub use status::{CanonicalPhase, NormalizedStatus};
