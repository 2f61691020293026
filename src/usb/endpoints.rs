//! Endpoint classification
//!
//! At attach time the bus side reports the device's advertised endpoints in
//! declaration order. One scan sorts them into the three roles the session
//! cares about; everything else is ignored.

use crate::error::AttachError;

/// Direction and transfer style of an advertised endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    BulkIn,
    BulkOut,
    /// Interrupt-style inbound endpoint carrying unsolicited events
    EventIn,
    /// Anything the session has no use for
    Other,
}

/// One endpoint as advertised by the device at attach time.
#[derive(Debug, Clone, Copy)]
pub struct EndpointInfo {
    pub address: u8,
    pub kind: EndpointKind,
    pub max_packet_size: u16,
}

/// A classified endpoint role. Immutable after attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub max_packet_size: u16,
}

/// The classified endpoint roles of a viable device.
///
/// Exactly one bulk-in and one bulk-out descriptor must exist for the device
/// to be usable; the event endpoint is optional.
#[derive(Debug, Clone)]
pub struct EndpointTable {
    pub bulk_in: EndpointDescriptor,
    pub bulk_out: EndpointDescriptor,
    pub event_in: Option<EndpointDescriptor>,
}

impl EndpointTable {
    /// Scan the advertised endpoints once, in declaration order.
    ///
    /// The first match for each role wins; later duplicates are ignored.
    /// Missing bulk-in or bulk-out makes the device unusable and fails the
    /// attach attempt.
    pub fn classify(endpoints: &[EndpointInfo]) -> Result<Self, AttachError> {
        let mut bulk_in = None;
        let mut bulk_out = None;
        let mut event_in = None;

        for ep in endpoints {
            let slot = match ep.kind {
                EndpointKind::BulkIn => &mut bulk_in,
                EndpointKind::BulkOut => &mut bulk_out,
                EndpointKind::EventIn => &mut event_in,
                EndpointKind::Other => continue,
            };
            if slot.is_none() {
                *slot = Some(EndpointDescriptor {
                    address: ep.address,
                    max_packet_size: ep.max_packet_size,
                });
            }
        }

        Ok(Self {
            bulk_in: bulk_in.ok_or(AttachError::MissingBulkIn)?,
            bulk_out: bulk_out.ok_or(AttachError::MissingBulkOut)?,
            event_in,
        })
    }
}

/// Allocate a host-side staging buffer of exactly the endpoint's negotiated
/// maximum packet size.
///
/// Uses a fallible reservation so an exhausted host reports a clean attach
/// failure instead of aborting.
pub fn alloc_transfer_buffer(descriptor: &EndpointDescriptor) -> Result<Vec<u8>, AttachError> {
    let size = descriptor.max_packet_size as usize;
    let mut buf = Vec::new();
    buf.try_reserve_exact(size)
        .map_err(|_| AttachError::OutOfResources)?;
    buf.resize(size, 0);
    Ok(buf)
}
