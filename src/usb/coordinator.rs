//! Session lifecycle coordination
//!
//! The coordinator owns the node registry that maps published identifiers
//! back to their sessions, mediates attach and detach against everything in
//! flight, and hands out client handles. Detach completes only after full
//! quiescence: the node is unpublished first so no new handle can reach the
//! session, the event loop is cancelled and joined, the session lock is taken
//! once to drain any in-progress transfer, and only then are the buffers and
//! the device reference released.

use crate::error::{AttachError, SessionError};
use crate::sync::CancelToken;
use crate::usb::endpoints::{EndpointInfo, EndpointTable, alloc_transfer_buffer};
use crate::usb::events;
use crate::usb::port::DevicePort;
use crate::usb::session::{CommandReply, Session, SessionState, TransferTimeouts};
use async_channel::Sender;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Identifier of a published device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

/// Notifications emitted by the coordinator and the event loops.
#[derive(Debug, Clone)]
pub enum DeviceNotification {
    /// A session was published under `node`.
    Attached { node: NodeId },
    /// The session behind `node` was torn down.
    Detached { node: NodeId },
    /// Opaque unsolicited payload from the device's event endpoint.
    Event { node: NodeId, payload: Vec<u8> },
}

/// `open` was called on a node that is not published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no published device node {}", .0.0)]
pub struct NotFound(pub NodeId);

struct Registry {
    published: HashMap<NodeId, Arc<Session>>,
    next_node: u32,
}

pub struct Coordinator {
    nodes: Mutex<Registry>,
    notifications: Sender<DeviceNotification>,
    timeouts: TransferTimeouts,
    event_poll: Duration,
}

impl Coordinator {
    pub fn new(
        notifications: Sender<DeviceNotification>,
        timeouts: TransferTimeouts,
        event_poll: Duration,
    ) -> Self {
        Self {
            nodes: Mutex::new(Registry {
                published: HashMap::new(),
                next_node: 1,
            }),
            notifications,
            timeouts,
            event_poll,
        }
    }

    /// Attach entry point, called by the bus side with the device's advertised
    /// endpoints in declaration order.
    ///
    /// Classifies the endpoints, allocates the transfer buffers, publishes
    /// the node, and arms the event loop if the device has an event endpoint.
    /// Any failure releases the partial allocations and publishes nothing;
    /// the failure is fatal to this attempt only.
    pub fn on_attach(
        &self,
        port: Arc<dyn DevicePort>,
        endpoints: &[EndpointInfo],
    ) -> Result<NodeId, AttachError> {
        let table = EndpointTable::classify(endpoints)?;
        let event_buf = match &table.event_in {
            Some(ep) => Some(alloc_transfer_buffer(ep)?),
            None => None,
        };
        let session = Arc::new(Session::new(port.clone(), table, self.timeouts)?);

        let node = {
            let mut reg = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
            let node = NodeId(reg.next_node);
            reg.next_node += 1;
            reg.published.insert(node, session.clone());
            node
        };

        if let Some(buf) = event_buf {
            // Viability was checked above; event_in is present when the
            // buffer is.
            if let Some(ep) = session.endpoints().event_in {
                let handle = events::spawn(
                    node,
                    port,
                    ep,
                    buf,
                    self.event_poll,
                    self.notifications.clone(),
                );
                session.install_event_loop(handle);
            }
        }

        info!(node = node.0, "device session published");
        // Lifecycle notifications displace the oldest queued message rather
        // than park the bus side behind a stalled consumer.
        let _ = self
            .notifications
            .force_send(DeviceNotification::Attached { node });
        Ok(node)
    }

    /// Detach entry point. Returns only after full quiescence: no further
    /// event-loop cycle will run and no synchronous transfer is in flight.
    /// A detach for an unknown or already-detached node is a no-op.
    pub fn on_detach(&self, node: NodeId) {
        let session = {
            let mut reg = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
            reg.published.remove(&node)
        };
        let Some(session) = session else {
            debug!(node = node.0, "detach for unknown node ignored");
            return;
        };

        // The node is unpublished at this point; no new client handle can
        // reach the session. Claim the one-way transition before touching
        // anything else.
        if !session.begin_detach() {
            return;
        }

        if let Some(event_loop) = session.take_event_loop() {
            event_loop.cancel_and_wait();
        }
        session.teardown();

        info!(node = node.0, "device session destroyed");
        // Detach must complete even when the notification channel is full.
        let _ = self
            .notifications
            .force_send(DeviceNotification::Detached { node });
    }

    /// Open a client handle on a published node.
    pub fn open(&self, node: NodeId) -> Result<ClientHandle, NotFound> {
        let reg = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        let session = reg.published.get(&node).cloned().ok_or(NotFound(node))?;
        Ok(ClientHandle {
            session,
            cancel: CancelToken::new(),
        })
    }

    /// Number of currently published nodes.
    pub fn published_count(&self) -> usize {
        self.nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .published
            .len()
    }
}

/// A client's reference to a session.
///
/// Holds the session object, not the underlying device, so a handle opened
/// before detach stays safe to use and to drop afterwards; its calls simply
/// fail with `DeviceMissing`. Clones share the cancel token, which lets one
/// thread abort another's pending lock wait.
#[derive(Clone)]
pub struct ClientHandle {
    session: Arc<Session>,
    cancel: CancelToken,
}

impl ClientHandle {
    /// Blocking bulk read of up to `max_len` bytes.
    pub fn read(&self, max_len: usize) -> Result<Vec<u8>, SessionError> {
        self.session.read(&self.cancel, max_len)
    }

    /// Blocking bulk write; returns the bytes the device accepted.
    pub fn write(&self, data: &[u8]) -> Result<usize, SessionError> {
        self.session.write(&self.cancel, data)
    }

    /// Read the device status word.
    pub fn get_status(&self) -> Result<u16, SessionError> {
        self.session.get_status(&self.cancel)
    }

    /// Set the front-panel LED.
    pub fn set_led(&self, value: u16) -> Result<(), SessionError> {
        self.session.set_led(&self.cancel, value)
    }

    /// Dispatch a control command by identifier with an opaque argument.
    pub fn dispatch(&self, command: u8, arg: u16) -> Result<CommandReply, SessionError> {
        self.session.dispatch(&self.cancel, command, arg)
    }

    /// Abort this handle's pending lock wait, if any. The blocked call
    /// returns `Interrupted` without device access.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Re-arm the handle after an interrupted call.
    pub fn clear_cancel(&self) {
        self.cancel.reset();
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }
}
