//! Host-bus integration
//!
//! Bridges rusb to the coordinator: enumerates devices matching the
//! configured vendor/product, registers hot-plug callbacks, opens the device
//! and claims its interface, collects the advertised endpoints, and feeds
//! attach/detach into the coordinator. Runs `handle_events` in a dedicated
//! worker thread so blocking USB work stays off the async runtime.

use crate::config::DeviceMatch;
use crate::usb::coordinator::{Coordinator, NodeId};
use crate::usb::endpoints::{EndpointInfo, EndpointKind};
use crate::usb::port::RusbPort;
use async_channel::{Receiver, Sender, unbounded};
use rusb::{Context, Device, Direction, Hotplug, HotplugBuilder, Registration, TransferType, UsbContext};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Hot-plug notifications forwarded from the libusb callback context to the
/// worker loop, which does the actual attach/detach work.
enum HotplugMessage {
    Arrived(Device<Context>),
    Left { bus: u8, address: u8 },
}

struct HotplugForwarder {
    tx: Sender<HotplugMessage>,
}

impl Hotplug<Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            bus = device.bus_number(),
            address = device.address(),
            "hot-plug: device arrived"
        );
        let _ = self.tx.send_blocking(HotplugMessage::Arrived(device));
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            bus = device.bus_number(),
            address = device.address(),
            "hot-plug: device left"
        );
        let _ = self.tx.send_blocking(HotplugMessage::Left {
            bus: device.bus_number(),
            address: device.address(),
        });
    }
}

/// Bus manager owned by the worker thread.
pub struct BusManager {
    context: Context,
    coordinator: Arc<Coordinator>,
    device_match: DeviceMatch,
    /// (bus, address) -> published node for devices we attached
    nodes: HashMap<(u8, u8), NodeId>,
    _hotplug: Option<Registration<Context>>,
    hotplug_rx: Receiver<HotplugMessage>,
    hotplug_tx: Sender<HotplugMessage>,
}

impl BusManager {
    pub fn new(
        coordinator: Arc<Coordinator>,
        device_match: DeviceMatch,
    ) -> Result<Self, rusb::Error> {
        let context = Context::new()?;
        let (hotplug_tx, hotplug_rx) = unbounded();

        Ok(Self {
            context,
            coordinator,
            device_match,
            nodes: HashMap::new(),
            _hotplug: None,
            hotplug_rx,
            hotplug_tx,
        })
    }

    /// Enumerate already-present devices and register hot-plug callbacks.
    pub fn initialize(&mut self) -> Result<(), rusb::Error> {
        for device in self.context.devices()?.iter() {
            if self.matches(&device) {
                self.handle_arrived(device);
            }
        }

        if rusb::has_hotplug() {
            let registration = HotplugBuilder::new()
                .vendor_id(self.device_match.vendor_id)
                .product_id(self.device_match.product_id)
                .enumerate(false)
                .register(
                    &self.context,
                    Box::new(HotplugForwarder {
                        tx: self.hotplug_tx.clone(),
                    }),
                )?;
            self._hotplug = Some(registration);
            debug!("hot-plug callbacks registered");
        } else {
            warn!("hot-plug not supported on this platform, relying on initial enumeration");
        }

        info!(attached = self.nodes.len(), "bus manager initialized");
        Ok(())
    }

    fn matches(&self, device: &Device<Context>) -> bool {
        match device.device_descriptor() {
            Ok(desc) => {
                desc.vendor_id() == self.device_match.vendor_id
                    && desc.product_id() == self.device_match.product_id
            }
            Err(_) => false,
        }
    }

    fn handle_arrived(&mut self, device: Device<Context>) {
        let key = (device.bus_number(), device.address());
        if self.nodes.contains_key(&key) {
            return;
        }
        if !self.matches(&device) {
            return;
        }

        match self.attach(&device) {
            Ok(node) => {
                self.nodes.insert(key, node);
                info!(
                    bus = key.0,
                    address = key.1,
                    node = node.0,
                    "front-panel device attached"
                );
            }
            Err(err) => {
                // Fatal to this attach attempt only.
                warn!(bus = key.0, address = key.1, error = %err, "attach failed");
            }
        }
    }

    fn attach(&self, device: &Device<Context>) -> Result<NodeId, anyhow::Error> {
        let (interface, endpoints) = collect_endpoints(device)?;

        let handle = device.open()?;
        if handle.kernel_driver_active(interface).unwrap_or(false) {
            if let Err(err) = handle.detach_kernel_driver(interface) {
                warn!(interface, error = %err, "failed to detach kernel driver");
            }
        }
        handle.claim_interface(interface)?;

        let port = Arc::new(RusbPort::new(handle, interface));
        let node = self.coordinator.on_attach(port, &endpoints)?;
        Ok(node)
    }

    fn handle_left(&mut self, bus: u8, address: u8) {
        if let Some(node) = self.nodes.remove(&(bus, address)) {
            info!(bus, address, node = node.0, "front-panel device left");
            self.coordinator.on_detach(node);
        }
    }

    /// Worker loop: drain hot-plug messages, process USB events with a
    /// timeout so the stop flag is observed regularly, and detach everything
    /// still published on the way out.
    pub fn run(mut self, stop: Arc<AtomicBool>) {
        info!("usb worker thread started");

        while !stop.load(Ordering::Acquire) {
            while let Ok(msg) = self.hotplug_rx.try_recv() {
                match msg {
                    HotplugMessage::Arrived(device) => self.handle_arrived(device),
                    HotplugMessage::Left { bus, address } => self.handle_left(bus, address),
                }
            }

            match self.context.handle_events(Some(Duration::from_millis(100))) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => {
                    debug!("usb event handling interrupted");
                }
                Err(err) => {
                    warn!(error = %err, "error handling usb events");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }

        let remaining: Vec<NodeId> = self.nodes.drain().map(|(_, node)| node).collect();
        for node in remaining {
            self.coordinator.on_detach(node);
        }

        info!("usb worker thread stopped");
    }
}

/// Walk the active configuration and return the first interface that
/// advertises endpoints, together with those endpoints in declaration order.
fn collect_endpoints(device: &Device<Context>) -> Result<(u8, Vec<EndpointInfo>), rusb::Error> {
    let config = device.active_config_descriptor()?;

    for interface in config.interfaces() {
        for desc in interface.descriptors() {
            let endpoints: Vec<EndpointInfo> = desc
                .endpoint_descriptors()
                .map(|ep| EndpointInfo {
                    address: ep.address(),
                    kind: classify_kind(ep.transfer_type(), ep.direction()),
                    max_packet_size: ep.max_packet_size(),
                })
                .collect();
            if !endpoints.is_empty() {
                return Ok((desc.interface_number(), endpoints));
            }
        }
    }

    Err(rusb::Error::NotFound)
}

fn classify_kind(transfer: TransferType, direction: Direction) -> EndpointKind {
    match (transfer, direction) {
        (TransferType::Bulk, Direction::In) => EndpointKind::BulkIn,
        (TransferType::Bulk, Direction::Out) => EndpointKind::BulkOut,
        (TransferType::Interrupt, Direction::In) => EndpointKind::EventIn,
        _ => EndpointKind::Other,
    }
}

/// Handle to the running worker thread.
pub struct WorkerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Stop the worker and block until it has detached every session and
    /// exited.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Spawn the bus worker thread.
pub fn spawn_bus_worker(
    coordinator: Arc<Coordinator>,
    device_match: DeviceMatch,
) -> Result<WorkerHandle, rusb::Error> {
    let mut manager = BusManager::new(coordinator, device_match)?;
    manager.initialize()?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let thread = std::thread::Builder::new()
        .name("xfp-usb-worker".to_string())
        .spawn(move || manager.run(stop_flag))
        .expect("Failed to spawn USB worker thread");

    Ok(WorkerHandle {
        stop,
        thread: Some(thread),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_kind() {
        assert_eq!(
            classify_kind(TransferType::Bulk, Direction::In),
            EndpointKind::BulkIn
        );
        assert_eq!(
            classify_kind(TransferType::Bulk, Direction::Out),
            EndpointKind::BulkOut
        );
        assert_eq!(
            classify_kind(TransferType::Interrupt, Direction::In),
            EndpointKind::EventIn
        );
        assert_eq!(
            classify_kind(TransferType::Interrupt, Direction::Out),
            EndpointKind::Other
        );
        assert_eq!(
            classify_kind(TransferType::Control, Direction::In),
            EndpointKind::Other
        );
        assert_eq!(
            classify_kind(TransferType::Isochronous, Direction::In),
            EndpointKind::Other
        );
    }
}
