//! Session manager for the Apple Xserve front-panel USB device
//!
//! The crate discovers the device's communication endpoints at attach time,
//! serializes blocking bulk transfers and vendor control commands against
//! concurrent callers, runs a background receive loop for unsolicited event
//! notifications, and tears the session down exactly once on hot-unplug,
//! with no use of freed resources, no leak, and no deadlock under any
//! interleaving of transfers, event cycles, and detach.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use xfp_usb::config::Config;
//! use xfp_usb::usb::{Coordinator, spawn_bus_worker};
//!
//! let config = Config::default();
//! let (notify_tx, _notify_rx) = async_channel::bounded(256);
//! let coordinator = Arc::new(Coordinator::new(
//!     notify_tx,
//!     config.transfer.timeouts(),
//!     config.transfer.event_poll(),
//! ));
//! let worker = spawn_bus_worker(coordinator.clone(), config.device).unwrap();
//! // ... open client handles via coordinator.open(node) ...
//! worker.shutdown();
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod sync;
pub mod usb;

pub use error::{AttachError, PortError, SessionError};
pub use usb::coordinator::{ClientHandle, Coordinator, DeviceNotification, NodeId, NotFound};
pub use usb::session::{
    CMD_GET_STATUS, CMD_SET_LED, CommandReply, SessionState, TransferTimeouts,
};
