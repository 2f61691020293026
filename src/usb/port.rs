//! Device transfer seam
//!
//! [`DevicePort`] is the narrow surface through which the session talks to
//! the attached device: blocking bulk, interrupt, and vendor control
//! transfers with explicit timeouts. The production implementation wraps an
//! open rusb handle; tests substitute a scripted port.

use crate::error::PortError;
use rusb::{Direction, Recipient, RequestType, UsbContext};
use std::time::Duration;
use tracing::debug;

/// Blocking transfer surface of one attached device.
///
/// All calls suspend the caller for at most `timeout`. Implementations map
/// their native errors to [`PortError`]; the gateways decide what is terminal
/// and what is retryable.
pub trait DevicePort: Send + Sync {
    /// Receive up to `buf.len()` bytes from a bulk-in endpoint. Returns the
    /// number of bytes the device actually completed.
    fn bulk_in(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize, PortError>;

    /// Send `data` to a bulk-out endpoint. Returns the number of bytes the
    /// device accepted, which may be less than `data.len()`.
    fn bulk_out(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize, PortError>;

    /// Receive one unsolicited notification cycle from an interrupt-in
    /// endpoint.
    fn interrupt_in(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, PortError>;

    /// Inbound vendor-defined control request with a fixed-size payload.
    fn control_in(
        &self,
        request: u8,
        value: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, PortError>;

    /// Outbound vendor-defined control request; `value` carries the argument,
    /// `data` is usually empty.
    fn control_out(
        &self,
        request: u8,
        value: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, PortError>;
}

/// Production port backed by an open rusb device handle with its interface
/// already claimed.
pub struct RusbPort<T: UsbContext> {
    handle: rusb::DeviceHandle<T>,
    interface: u8,
}

impl<T: UsbContext> RusbPort<T> {
    pub fn new(handle: rusb::DeviceHandle<T>, interface: u8) -> Self {
        Self { handle, interface }
    }
}

impl<T: UsbContext> DevicePort for RusbPort<T> {
    fn bulk_in(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize, PortError> {
        debug!(endpoint = format_args!("{endpoint:#04x}"), len = buf.len(), "bulk in");
        self.handle
            .read_bulk(endpoint, buf, timeout)
            .map_err(map_rusb_error)
    }

    fn bulk_out(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize, PortError> {
        debug!(endpoint = format_args!("{endpoint:#04x}"), len = data.len(), "bulk out");
        self.handle
            .write_bulk(endpoint, data, timeout)
            .map_err(map_rusb_error)
    }

    fn interrupt_in(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, PortError> {
        self.handle
            .read_interrupt(endpoint, buf, timeout)
            .map_err(map_rusb_error)
    }

    fn control_in(
        &self,
        request: u8,
        value: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, PortError> {
        let request_type = rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Interface);
        self.handle
            .read_control(
                request_type,
                request,
                value,
                self.interface as u16,
                buf,
                timeout,
            )
            .map_err(map_rusb_error)
    }

    fn control_out(
        &self,
        request: u8,
        value: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, PortError> {
        let request_type =
            rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Interface);
        self.handle
            .write_control(
                request_type,
                request,
                value,
                self.interface as u16,
                data,
                timeout,
            )
            .map_err(map_rusb_error)
    }
}

/// Map rusb errors to the domain taxonomy.
pub fn map_rusb_error(err: rusb::Error) -> PortError {
    match err {
        rusb::Error::Timeout => PortError::Timeout,
        rusb::Error::Pipe => PortError::Pipe,
        rusb::Error::NoDevice | rusb::Error::NotFound => PortError::NoDevice,
        rusb::Error::Overflow => PortError::Overflow,
        rusb::Error::Io => PortError::Io,
        rusb::Error::Access => PortError::Access,
        other => PortError::Other(other.to_string()),
    }
}
