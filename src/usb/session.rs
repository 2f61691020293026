//! Device session and its gateways
//!
//! A [`Session`] is the live binding between the host and one attached
//! device: its classified endpoints, the host-side transfer buffers, and the
//! single lock that serializes synchronous and control operations. The
//! lifecycle is one-way: live, then detaching, then destroyed. Gateway calls
//! that observe a non-live state fail with `DeviceMissing` without touching
//! the device.

use crate::error::{AttachError, SessionError};
use crate::sync::{CancelToken, InterruptibleMutex};
use crate::usb::endpoints::{EndpointTable, alloc_transfer_buffer};
use crate::usb::events::EventLoopHandle;
use crate::usb::port::DevicePort;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Control command: read the fixed-size status word.
pub const CMD_GET_STATUS: u8 = 0x01;
/// Control command: set the front-panel LED; the value rides in the request's
/// parameter field, there is no data phase.
pub const CMD_SET_LED: u8 = 0x02;

/// Size of the status payload returned by [`CMD_GET_STATUS`].
const STATUS_PAYLOAD_LEN: usize = 2;

/// Timeouts applied by the gateways. Control exchanges are expected to be
/// small and fast, so they get a shorter window than bulk transfers.
#[derive(Debug, Clone, Copy)]
pub struct TransferTimeouts {
    pub bulk: Duration,
    pub control: Duration,
}

impl Default for TransferTimeouts {
    fn default() -> Self {
        Self {
            bulk: Duration::from_millis(5000),
            control: Duration::from_millis(1000),
        }
    }
}

/// Session lifecycle states. Transitions are one-way and irreversible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Live,
    Detaching,
    Destroyed,
}

const STATE_LIVE: u8 = 0;
const STATE_DETACHING: u8 = 1;
const STATE_DESTROYED: u8 = 2;

/// Result of a dispatched control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandReply {
    /// Status word returned by [`CMD_GET_STATUS`]
    Status(u16),
    /// Acknowledgement of a command with no result payload
    Done,
}

/// State guarded by the session lock.
struct IoState {
    /// Counted reference to the device, shared with the bus side. Taken
    /// exactly once at teardown; `None` afterwards.
    port: Option<Arc<dyn DevicePort>>,
    /// Session-owned staging buffer for bulk-in transfers. Never exposed to
    /// callers and never reused for the outbound direction.
    bulk_in_buf: Vec<u8>,
}

pub struct Session {
    state: AtomicU8,
    endpoints: EndpointTable,
    timeouts: TransferTimeouts,
    io: InterruptibleMutex<IoState>,
    /// Handle to the event receive loop; present while live if the device
    /// advertises an event endpoint.
    event_loop: Mutex<Option<EventLoopHandle>>,
}

impl Session {
    /// Build a live session around a classified endpoint table. Allocates the
    /// bulk-in staging buffer; failure here leaves nothing behind.
    pub(crate) fn new(
        port: Arc<dyn DevicePort>,
        endpoints: EndpointTable,
        timeouts: TransferTimeouts,
    ) -> Result<Self, AttachError> {
        let bulk_in_buf = alloc_transfer_buffer(&endpoints.bulk_in)?;
        Ok(Self {
            state: AtomicU8::new(STATE_LIVE),
            endpoints,
            timeouts,
            io: InterruptibleMutex::new(IoState {
                port: Some(port),
                bulk_in_buf,
            }),
            event_loop: Mutex::new(None),
        })
    }

    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::Acquire) {
            STATE_LIVE => SessionState::Live,
            STATE_DETACHING => SessionState::Detaching,
            _ => SessionState::Destroyed,
        }
    }

    pub fn endpoints(&self) -> &EndpointTable {
        &self.endpoints
    }

    /// Blocking bulk read.
    ///
    /// Requests at most `min(bulk-in max packet size, max_len)` bytes into
    /// the session buffer and copies out exactly what the device completed.
    /// An oversized `max_len` is silently capped, not rejected.
    pub fn read(&self, cancel: &CancelToken, max_len: usize) -> Result<Vec<u8>, SessionError> {
        let mut io = self
            .io
            .lock(cancel)
            .map_err(|_| SessionError::Interrupted)?;
        if self.state() != SessionState::Live {
            return Err(SessionError::DeviceMissing);
        }
        let IoState { port, bulk_in_buf } = &mut *io;
        let port = port.as_ref().ok_or(SessionError::DeviceMissing)?;

        let want = max_len.min(self.endpoints.bulk_in.max_packet_size as usize);
        let done = port.bulk_in(
            self.endpoints.bulk_in.address,
            &mut bulk_in_buf[..want],
            self.timeouts.bulk,
        )?;
        Ok(bulk_in_buf[..done].to_vec())
    }

    /// Blocking bulk write.
    ///
    /// Stages the caller's bytes into a fresh buffer sized to the request
    /// before taking the lock; the bulk-in buffer is never used for the
    /// outbound direction. Zero-length writes are issued as-is, since the
    /// device may treat them as signals. Returns the number of bytes the
    /// device accepted, which may be less than requested.
    pub fn write(&self, cancel: &CancelToken, data: &[u8]) -> Result<usize, SessionError> {
        let mut staged = Vec::new();
        staged
            .try_reserve_exact(data.len())
            .map_err(|_| SessionError::OutOfResources)?;
        staged.extend_from_slice(data);

        let io = self
            .io
            .lock(cancel)
            .map_err(|_| SessionError::Interrupted)?;
        if self.state() != SessionState::Live {
            return Err(SessionError::DeviceMissing);
        }
        let port = io.port.as_ref().ok_or(SessionError::DeviceMissing)?;

        let accepted = port.bulk_out(
            self.endpoints.bulk_out.address,
            &staged,
            self.timeouts.bulk,
        )?;
        Ok(accepted)
    }

    /// Read the device's status word over the control channel.
    pub fn get_status(&self, cancel: &CancelToken) -> Result<u16, SessionError> {
        let io = self
            .io
            .lock(cancel)
            .map_err(|_| SessionError::Interrupted)?;
        if self.state() != SessionState::Live {
            return Err(SessionError::DeviceMissing);
        }
        let port = io.port.as_ref().ok_or(SessionError::DeviceMissing)?;

        let mut payload = [0u8; STATUS_PAYLOAD_LEN];
        let done = port.control_in(CMD_GET_STATUS, 0, &mut payload, self.timeouts.control)?;
        if done < STATUS_PAYLOAD_LEN {
            return Err(SessionError::ShortControlReply {
                expected: STATUS_PAYLOAD_LEN,
                got: done,
            });
        }
        Ok(u16::from_le_bytes(payload))
    }

    /// Set the front-panel LED. The value travels in the request's parameter
    /// field; there is no data phase.
    pub fn set_led(&self, cancel: &CancelToken, value: u16) -> Result<(), SessionError> {
        let io = self
            .io
            .lock(cancel)
            .map_err(|_| SessionError::Interrupted)?;
        if self.state() != SessionState::Live {
            return Err(SessionError::DeviceMissing);
        }
        let port = io.port.as_ref().ok_or(SessionError::DeviceMissing)?;

        port.control_out(CMD_SET_LED, value, &[], self.timeouts.control)?;
        Ok(())
    }

    /// Command-dispatch entry: routes a command identifier and opaque
    /// argument to the matching control operation. Unknown identifiers are
    /// rejected before any lock or device access.
    pub fn dispatch(
        &self,
        cancel: &CancelToken,
        command: u8,
        arg: u16,
    ) -> Result<CommandReply, SessionError> {
        match command {
            CMD_GET_STATUS => self.get_status(cancel).map(CommandReply::Status),
            CMD_SET_LED => self.set_led(cancel, arg).map(|_| CommandReply::Done),
            other => Err(SessionError::UnsupportedCommand(other)),
        }
    }

    /// Store the armed event loop's handle. Called once during attach.
    pub(crate) fn install_event_loop(&self, handle: EventLoopHandle) {
        let mut slot = self.event_loop.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(handle);
    }

    /// Move to the detaching state. Returns false if another teardown already
    /// claimed the transition, making a second detach a no-op.
    pub(crate) fn begin_detach(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_LIVE,
                STATE_DETACHING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Take the event loop handle for cancellation, if one was armed.
    pub(crate) fn take_event_loop(&self) -> Option<EventLoopHandle> {
        self.event_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Final teardown: drain any in-flight synchronous transfer by taking the
    /// session lock once, then release the device reference and the staging
    /// buffer exactly once. Only the coordinator calls this, after the event
    /// loop has quiesced.
    pub(crate) fn teardown(&self) {
        let mut io = self.io.lock_uncancelable();
        io.port.take();
        io.bulk_in_buf = Vec::new();
        drop(io);
        self.state.store(STATE_DESTROYED, Ordering::Release);
        debug!("session resources released");
    }
}
