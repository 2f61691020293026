//! Asynchronous event receive loop
//!
//! If the device advertises an event endpoint, one loop per session receives
//! unsolicited notifications in the background and forwards the raw payloads
//! to the notification sink. Payload interpretation is deliberately opaque
//! here.
//!
//! The loop runs on its own thread, owns the event buffer outright, and never
//! takes the session lock, so it cannot be blocked by a long synchronous
//! transfer. It re-arms itself after every successful cycle; a poll timeout
//! is an empty cycle and also re-arms. The first device-reported error stops
//! the loop permanently: an event source that starts failing goes silent
//! instead of busy-looping, and nothing is propagated to synchronous callers.
//!
//! Delivery never blocks cancellation. Events are fire-and-forget, so when
//! the notification sink stays full past one poll interval the payload is
//! shed and the loop goes back to the device.

use crate::error::PortError;
use crate::usb::coordinator::{DeviceNotification, NodeId};
use crate::usb::endpoints::EndpointDescriptor;
use crate::usb::port::DevicePort;
use async_channel::{Sender, TrySendError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Interval at which a delivery blocked on a full sink rechecks the stop
/// flag.
const SEND_RETRY: Duration = Duration::from_millis(5);

/// Owned handle to a running event loop. The coordinator consumes it during
/// detach to guarantee quiescence.
pub struct EventLoopHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoopHandle {
    /// Request cancellation and block until the loop's thread has fully
    /// returned. After this returns, no further cycle will run and no
    /// callback is in flight.
    pub fn cancel_and_wait(mut self) {
        self.join();
    }

    fn join(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for EventLoopHandle {
    fn drop(&mut self) {
        self.join();
    }
}

/// Arm the receive loop on the event endpoint. The loop owns `buf` (sized to
/// the endpoint's maximum packet size) and its own counted reference to the
/// device port.
pub(crate) fn spawn(
    node: NodeId,
    port: Arc<dyn DevicePort>,
    endpoint: EndpointDescriptor,
    buf: Vec<u8>,
    poll: Duration,
    sink: Sender<DeviceNotification>,
) -> EventLoopHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let thread = std::thread::Builder::new()
        .name(format!("xfp-events-{}", node.0))
        .spawn(move || run(node, port, endpoint, buf, poll, sink, stop_flag))
        .expect("Failed to spawn event loop thread");

    EventLoopHandle {
        stop,
        thread: Some(thread),
    }
}

fn run(
    node: NodeId,
    port: Arc<dyn DevicePort>,
    endpoint: EndpointDescriptor,
    mut buf: Vec<u8>,
    poll: Duration,
    sink: Sender<DeviceNotification>,
    stop: Arc<AtomicBool>,
) {
    debug!(node = node.0, endpoint = endpoint.address, "event loop armed");

    loop {
        if stop.load(Ordering::Acquire) {
            debug!(node = node.0, "event loop cancelled");
            break;
        }

        match port.interrupt_in(endpoint.address, &mut buf, poll) {
            Ok(done) => {
                let payload = buf[..done].to_vec();
                if !deliver(
                    node,
                    &sink,
                    &stop,
                    poll,
                    DeviceNotification::Event { node, payload },
                ) {
                    break;
                }
            }
            Err(PortError::Timeout) => {
                // Nothing pending this cycle; re-arm.
            }
            Err(err) => {
                warn!(
                    node = node.0,
                    error = %err,
                    "event endpoint reported an error, stopping receive loop"
                );
                break;
            }
        }
    }
}

/// Hand one payload to the sink without ever parking past cancellation.
///
/// Retries a full sink at [`SEND_RETRY`] intervals, rechecking the stop flag
/// each time; a sink still full after one poll interval sheds the payload.
/// Returns false when the loop should stop (cancelled, or sink closed).
fn deliver(
    node: NodeId,
    sink: &Sender<DeviceNotification>,
    stop: &AtomicBool,
    poll: Duration,
    notification: DeviceNotification,
) -> bool {
    let mut pending = notification;
    let deadline = Instant::now() + poll;
    loop {
        if stop.load(Ordering::Acquire) {
            debug!(node = node.0, "event loop cancelled during delivery");
            return false;
        }
        match sink.try_send(pending) {
            Ok(()) => return true,
            Err(TrySendError::Closed(_)) => {
                // No caller waits on this cycle; a closed sink means the
                // process is shutting down.
                debug!(node = node.0, "notification sink closed, stopping event loop");
                return false;
            }
            Err(TrySendError::Full(back)) => {
                if Instant::now() >= deadline {
                    debug!(node = node.0, "notification sink full, shedding event");
                    return true;
                }
                pending = back;
                std::thread::sleep(SEND_RETRY);
            }
        }
    }
}
