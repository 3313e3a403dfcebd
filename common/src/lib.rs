pub mod api;
pub mod button;
pub mod clock;
pub mod config;
pub mod datalog;
pub mod mode;
pub mod network;
pub mod reporter;
pub mod scheduler;
pub mod storage;
pub mod types;

pub use button::{Gesture, GestureAction, GestureDetector};
pub use clock::{monotonic_ms, SyncOutcome, WallClock, ZonedClock};
pub use config::{GestureConfig, NetworkConfig, NodeConfig, RuntimeConfig};
pub use datalog::DataLog;
pub use mode::ServiceMode;
pub use network::{NetworkProvisioner, PortalDecision, PortalTimer};
pub use reporter::{Broadcaster, ReportOutcome, Reporter, TemperatureReading, TemperatureSensor};
pub use scheduler::{Board, Scheduler, Tick, TickOutcome};
pub use storage::{FsStorage, MemoryStorage, Storage, StorageError};
pub use types::{NodeStatus, ServiceModePayload};
