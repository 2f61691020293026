//! Device-facing modules: endpoint classification, the transfer seam, the
//! session gateways, the event receive loop, and lifecycle coordination.

pub mod coordinator;
pub mod endpoints;
pub mod events;
pub mod manager;
pub mod port;
pub mod session;

pub use coordinator::{ClientHandle, Coordinator, DeviceNotification, NodeId, NotFound};
pub use manager::{WorkerHandle, spawn_bus_worker};
