//! Shared test support: a scripted in-memory device port and coordinator
//! constructors with short timeouts.

#![allow(dead_code)]

use async_channel::Receiver;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use xfp_usb::error::PortError;
use xfp_usb::usb::coordinator::{Coordinator, DeviceNotification, NodeId};
use xfp_usb::usb::endpoints::{EndpointInfo, EndpointKind};
use xfp_usb::usb::port::DevicePort;
use xfp_usb::{CMD_GET_STATUS, CMD_SET_LED, TransferTimeouts};

pub fn ep(address: u8, kind: EndpointKind, max_packet_size: u16) -> EndpointInfo {
    EndpointInfo {
        address,
        kind,
        max_packet_size,
    }
}

/// bulk-in(64) + bulk-out(64) + event-in(8)
pub fn full_endpoint_set() -> Vec<EndpointInfo> {
    vec![
        ep(0x81, EndpointKind::BulkIn, 64),
        ep(0x01, EndpointKind::BulkOut, 64),
        ep(0x82, EndpointKind::EventIn, 8),
    ]
}

/// bulk-in(64) + bulk-out(64), no event endpoint
pub fn bulk_only_endpoint_set() -> Vec<EndpointInfo> {
    vec![
        ep(0x81, EndpointKind::BulkIn, 64),
        ep(0x01, EndpointKind::BulkOut, 64),
    ]
}

/// Scripted device port. Bulk and control responses are queued ahead of
/// time; an exhausted bulk script times out, an exhausted interrupt script
/// reports empty poll cycles.
#[derive(Default)]
pub struct MockPort {
    /// Queued bulk-in outcomes
    pub bulk_in_script: Mutex<VecDeque<Result<Vec<u8>, PortError>>>,
    /// Buffer length offered by each bulk-in call
    pub bulk_in_requests: Mutex<Vec<usize>>,
    /// Payload of each bulk-out call
    pub bulk_out_log: Mutex<Vec<Vec<u8>>>,
    /// Queued bulk-out outcomes (bytes accepted); default accepts everything
    pub bulk_out_script: Mutex<VecDeque<Result<usize, PortError>>>,
    /// Queued interrupt-in outcomes
    pub interrupt_script: Mutex<VecDeque<Result<Vec<u8>, PortError>>>,
    /// Number of interrupt-in cycles issued
    pub interrupt_calls: AtomicUsize,
    /// Status word served to `CMD_GET_STATUS`
    pub status_word: Mutex<u16>,
    /// Truncate `CMD_GET_STATUS` replies to this many bytes when set
    pub status_reply_len: Mutex<Option<usize>>,
    /// Values received by `CMD_SET_LED`
    pub led_log: Mutex<Vec<u16>>,
    /// Artificial latency applied to bulk and control transfers
    pub transfer_delay: Mutex<Duration>,
    /// Bulk/control transfers currently in flight
    in_flight: AtomicUsize,
    /// High-water mark of concurrent bulk/control transfers
    pub max_in_flight: AtomicUsize,
    /// Total bulk/control device accesses (interrupt cycles excluded)
    pub device_accesses: AtomicUsize,
}

impl MockPort {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_transfer_delay(delay: Duration) -> Arc<Self> {
        let port = Self::default();
        *port.transfer_delay.lock().unwrap() = delay;
        Arc::new(port)
    }

    pub fn push_bulk_in(&self, outcome: Result<Vec<u8>, PortError>) {
        self.bulk_in_script.lock().unwrap().push_back(outcome);
    }

    pub fn push_bulk_out(&self, outcome: Result<usize, PortError>) {
        self.bulk_out_script.lock().unwrap().push_back(outcome);
    }

    pub fn push_interrupt(&self, outcome: Result<Vec<u8>, PortError>) {
        self.interrupt_script.lock().unwrap().push_back(outcome);
    }

    pub fn accesses(&self) -> usize {
        self.device_accesses.load(Ordering::SeqCst)
    }

    fn begin(&self) {
        self.device_accesses.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.transfer_delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }

    fn end(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DevicePort for MockPort {
    fn bulk_in(&self, _endpoint: u8, buf: &mut [u8], _timeout: Duration) -> Result<usize, PortError> {
        self.bulk_in_requests.lock().unwrap().push(buf.len());
        self.begin();
        let outcome = self
            .bulk_in_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(PortError::Timeout));
        self.end();
        match outcome {
            Ok(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Err(err) => Err(err),
        }
    }

    fn bulk_out(&self, _endpoint: u8, data: &[u8], _timeout: Duration) -> Result<usize, PortError> {
        self.begin();
        self.bulk_out_log.lock().unwrap().push(data.to_vec());
        let outcome = self
            .bulk_out_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(data.len()));
        self.end();
        outcome
    }

    fn interrupt_in(
        &self,
        _endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, PortError> {
        self.interrupt_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.interrupt_script.lock().unwrap().pop_front();
        match next {
            Some(Ok(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Some(Err(err)) => Err(err),
            None => {
                // Nothing queued: behave like an empty poll cycle.
                thread::sleep(timeout.min(Duration::from_millis(5)));
                Err(PortError::Timeout)
            }
        }
    }

    fn control_in(
        &self,
        request: u8,
        _value: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, PortError> {
        self.begin();
        let outcome = match request {
            CMD_GET_STATUS => {
                let word = self.status_word.lock().unwrap().to_le_bytes();
                let limit = self.status_reply_len.lock().unwrap().unwrap_or(word.len());
                let n = word.len().min(buf.len()).min(limit);
                buf[..n].copy_from_slice(&word[..n]);
                Ok(n)
            }
            _ => Err(PortError::Pipe),
        };
        self.end();
        outcome
    }

    fn control_out(
        &self,
        request: u8,
        value: u16,
        _data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, PortError> {
        self.begin();
        let outcome = match request {
            CMD_SET_LED => {
                self.led_log.lock().unwrap().push(value);
                Ok(0)
            }
            _ => Err(PortError::Pipe),
        };
        self.end();
        outcome
    }
}

/// Short timeouts so failing paths do not stall the suite.
pub fn test_timeouts() -> TransferTimeouts {
    TransferTimeouts {
        bulk: Duration::from_millis(200),
        control: Duration::from_millis(100),
    }
}

pub fn new_coordinator() -> (Arc<Coordinator>, Receiver<DeviceNotification>) {
    let (tx, rx) = async_channel::unbounded();
    let coordinator = Arc::new(Coordinator::new(
        tx,
        test_timeouts(),
        Duration::from_millis(10),
    ));
    (coordinator, rx)
}

/// Attach a mock port and return the published node.
pub fn attach_device(
    port: Arc<MockPort>,
    endpoints: &[EndpointInfo],
) -> (Arc<Coordinator>, Receiver<DeviceNotification>, NodeId) {
    let (coordinator, rx) = new_coordinator();
    let node = coordinator
        .on_attach(port, endpoints)
        .expect("attach should succeed");
    (coordinator, rx, node)
}

/// Wait for the next `Event` notification, skipping lifecycle notifications.
pub fn next_event_payload(
    rx: &Receiver<DeviceNotification>,
    timeout: Duration,
) -> Option<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match rx.try_recv() {
            Ok(DeviceNotification::Event { payload, .. }) => return Some(payload),
            Ok(_) => {}
            Err(_) => thread::sleep(Duration::from_millis(2)),
        }
    }
    None
}

/// Drain everything currently queued and count the detach notifications.
pub fn drain_detached_count(rx: &Receiver<DeviceNotification>) -> usize {
    let mut count = 0;
    while let Ok(notification) = rx.try_recv() {
        if matches!(notification, DeviceNotification::Detached { .. }) {
            count += 1;
        }
    }
    count
}
