//! Driver registry, matching and the bind/unbind protocol.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::dev::{DeviceId, LocationId};
use crate::error::TransferError;
use crate::hcd::ControllerId;
use crate::ipc::{DeviceInfo, DriverMessage};
use crate::stack::UsbStack;
use crate::transfer::{Pipe, PipeId, Transfer, UrbId, UrbState};
use crate::usb::{DeviceDescriptor, InterfaceDescriptor};

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DriverId(pub u32);

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "driver{}", self.0)
    }
}

bitflags::bitflags! {
    /// Which filter fields actually matched; the population count is the
    /// specificity score of the match.
    #[derive(Default)]
    pub struct MatchField: u8 {
        const CLASS = 1 << 0;
        const SUBCLASS = 1 << 1;
        const PROTOCOL = 1 << 2;
        const VENDOR = 1 << 3;
        const PRODUCT = 1 << 4;
    }
}

/// One interest declaration of a driver. `None` is a wildcard.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeviceFilter {
    #[serde(default)]
    pub class: Option<u8>,
    #[serde(default)]
    pub sub_class: Option<u8>,
    #[serde(default)]
    pub protocol: Option<u8>,
    #[serde(default)]
    pub vendor: Option<u16>,
    #[serde(default)]
    pub product: Option<u16>,
}

impl DeviceFilter {
    /// Match against a device/interface descriptor pair.
    ///
    /// Class, subclass and protocol are each tested against the device
    /// descriptor where it carries a non-zero value, and against the
    /// interface otherwise (device class 0 delegates classing to the
    /// interfaces). Vendor and product only ever live in the device
    /// descriptor. Any violated non-wildcard field voids the match.
    pub fn matches(
        &self,
        dev: &DeviceDescriptor,
        iface: &InterfaceDescriptor,
    ) -> Option<MatchField> {
        let mut fields = MatchField::empty();

        if let Some(class) = self.class {
            let actual = if dev.class != 0 { dev.class } else { iface.class };
            if class != actual {
                return None;
            }
            fields |= MatchField::CLASS;
        }
        if let Some(sub_class) = self.sub_class {
            let actual = if dev.sub_class != 0 {
                dev.sub_class
            } else {
                iface.sub_class
            };
            if sub_class != actual {
                return None;
            }
            fields |= MatchField::SUBCLASS;
        }
        if let Some(protocol) = self.protocol {
            let actual = if dev.protocol != 0 {
                dev.protocol
            } else {
                iface.protocol
            };
            if protocol != actual {
                return None;
            }
            fields |= MatchField::PROTOCOL;
        }
        if let Some(vendor) = self.vendor {
            let actual = dev.vendor;
            if vendor != actual {
                return None;
            }
            fields |= MatchField::VENDOR;
        }
        if let Some(product) = self.product {
            let actual = dev.product;
            if product != actual {
                return None;
            }
            fields |= MatchField::PRODUCT;
        }
        Some(fields)
    }
}

/// Payload of an insertion offer to an in-process driver.
#[derive(Clone, Copy, Debug)]
pub struct InsertionInfo {
    pub device: DeviceId,
    pub bus: ControllerId,
    pub address: u8,
    pub interface: u8,
    pub desc: DeviceDescriptor,
    pub location: LocationId,
}

/// A driver living in this process.
///
/// All three handlers are invoked without the stack's structural lock held,
/// so they may call back into the stack (open pipes, submit URBs).
pub trait UsbDriver: Send + Sync {
    /// Offer of a newly enumerated interface. Returning `true` claims the
    /// device.
    fn insertion(&self, info: &InsertionInfo) -> bool;

    fn deletion(&self, bus: ControllerId, address: u8, interface: u8);

    /// An asynchronous URB finished.
    fn completion(&self, pipe: PipeId, urb: UrbId, transferred: usize, error: Option<TransferError>);
}

pub(crate) enum DriverKind {
    Internal(Arc<dyn UsbDriver>),
    External { events: Sender<DriverMessage> },
}

pub(crate) struct DriverReg {
    pub name: String,
    pub kind: DriverKind,
    pub filters: Vec<DeviceFilter>,
    pub pipes: BTreeMap<PipeId, Arc<Pipe>>,
    pub urbs: BTreeMap<UrbId, Arc<Transfer>>,
    pub next_pipe: PipeId,
    pub next_urb: UrbId,
}

impl DriverReg {
    fn new(name: String, kind: DriverKind, filters: Vec<DeviceFilter>) -> Self {
        Self {
            name,
            kind,
            filters,
            pipes: BTreeMap::new(),
            urbs: BTreeMap::new(),
            // id 0 is reserved for "anonymous"
            next_pipe: 1,
            next_urb: 1,
        }
    }
}

impl UsbStack {
    /// Register a driver running in this process and re-attempt matching for
    /// every orphaned device.
    pub fn register_internal_driver(
        &self,
        name: &str,
        filters: Vec<DeviceFilter>,
        handler: Arc<dyn UsbDriver>,
    ) -> DriverId {
        self.insert_driver(DriverReg::new(
            name.to_owned(),
            DriverKind::Internal(handler),
            filters,
        ))
    }

    pub(crate) fn register_external_driver(
        &self,
        name: &str,
        filters: Vec<DeviceFilter>,
        events: Sender<DriverMessage>,
    ) -> DriverId {
        self.insert_driver(DriverReg::new(
            name.to_owned(),
            DriverKind::External { events },
            filters,
        ))
    }

    fn insert_driver(&self, reg: DriverReg) -> DriverId {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = DriverId(inner.next_driver);
            inner.next_driver += 1;
            info!("registered {} as {id}", reg.name);
            inner.drivers.insert(id, reg);
            id
        };
        self.rematch_orphans();
        id
    }

    /// Re-attempt binding for devices that no driver has claimed. The orphan
    /// set is rebuilt from the device arena on every call.
    fn rematch_orphans(&self) {
        let orphans: Vec<DeviceId> = {
            let inner = self.inner.lock().unwrap();
            inner
                .devices
                .values()
                .filter(|node| {
                    node.hub.is_none()
                        && !node.interfaces.is_empty()
                        && node.interfaces.iter().all(|iface| iface.driver.is_none())
                })
                .map(|node| node.id)
                .collect()
        };
        for dev in orphans {
            let _ = self.bind_device(dev);
        }
    }

    /// Find a driver for each interface of `dev` in turn; the first driver
    /// whose insertion handler accepts ownership ends the scan. A device no
    /// driver claims stays enumerated but orphaned.
    pub(crate) fn bind_device(&self, dev: DeviceId) -> crate::error::Result<()> {
        let interface_count = {
            let inner = self.inner.lock().unwrap();
            inner
                .devices
                .get(&dev)
                .ok_or(crate::error::Error::NoDevice)?
                .interfaces
                .len()
        };

        for index in 0..interface_count {
            let candidate = {
                let inner = self.inner.lock().unwrap();
                let node = match inner.devices.get(&dev) {
                    Some(node) => node,
                    None => return Ok(()),
                };
                let iface = &node.interfaces[index];
                if iface.driver.is_some() {
                    continue;
                }
                let mut best: Option<(DriverId, u32)> = None;
                for (&id, reg) in inner.drivers.iter() {
                    for filter in &reg.filters {
                        if let Some(fields) = filter.matches(&node.desc, &iface.desc) {
                            let score = fields.bits().count_ones();
                            // Strict comparison keeps the first driver found
                            // on ties.
                            if best.map_or(true, |(_, s)| score > s) {
                                best = Some((id, score));
                            }
                        }
                    }
                }
                best.map(|(id, _)| {
                    (
                        id,
                        InsertionInfo {
                            device: dev,
                            bus: node.controller,
                            address: node.address,
                            interface: index as u8,
                            desc: node.desc,
                            location: node.location,
                        },
                    )
                })
            };

            let Some((driver, info)) = candidate else {
                continue;
            };

            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(iface) = inner
                    .devices
                    .get_mut(&dev)
                    .and_then(|node| node.interfaces.get_mut(index))
                {
                    iface.driver = Some(driver);
                }
            }

            if self.offer_insertion(driver, &info) {
                info!("{dev} interface {index} bound to {driver}");
                return Ok(());
            }
            debug!("{driver} declined {dev} interface {index}");
            let mut inner = self.inner.lock().unwrap();
            if let Some(iface) = inner
                .devices
                .get_mut(&dev)
                .and_then(|node| node.interfaces.get_mut(index))
            {
                iface.driver = None;
            }
        }

        info!("{dev} left orphaned");
        Ok(())
    }

    fn offer_insertion(&self, driver: DriverId, info: &InsertionInfo) -> bool {
        enum Offer {
            Direct(Arc<dyn UsbDriver>),
            Message(Sender<DriverMessage>),
        }

        let offer = {
            let inner = self.inner.lock().unwrap();
            match inner.drivers.get(&driver).map(|reg| &reg.kind) {
                Some(DriverKind::Internal(handler)) => Offer::Direct(Arc::clone(handler)),
                Some(DriverKind::External { events }) => Offer::Message(events.clone()),
                None => return false,
            }
        };

        match offer {
            Offer::Direct(handler) => handler.insertion(info),
            Offer::Message(events) => {
                let token = self.next_token.fetch_add(1, Ordering::SeqCst);
                let (tx, rx) = bounded(1);
                self.insertion_waiters.lock().unwrap().insert(token, tx);

                let sent = events
                    .send(DriverMessage::Insertion {
                        token,
                        bus: info.bus,
                        address: info.address,
                        interface: info.interface,
                        device: DeviceInfo::from(&info.desc),
                        location: info.location,
                    })
                    .is_ok();
                let accepted = sent
                    && rx
                        .recv_timeout(Duration::from_millis(self.cfg.insertion_reply_ms))
                        .unwrap_or(false);
                self.insertion_waiters.lock().unwrap().remove(&token);
                accepted
            }
        }
    }

    pub(crate) fn insertion_reply(&self, token: u64, accept: bool) {
        if let Some(tx) = self.insertion_waiters.lock().unwrap().remove(&token) {
            let _ = tx.send(accept);
        }
    }

    /// Detach `driver` from one interface of `dev`: destroy every pipe the
    /// driver holds on the device (freeing URBs still queued against them),
    /// then notify the deletion handler. Idempotent with respect to a
    /// concurrent disconnect — a second call finds nothing to clear and does
    /// nothing.
    pub fn unbind(&self, driver: DriverId, dev: DeviceId, interface: u8) {
        let mut dequeue = Vec::new();
        let mut notify = None;

        {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            let Some(reg) = inner.drivers.get_mut(&driver) else {
                return;
            };

            let pipes: Vec<PipeId> = reg
                .pipes
                .iter()
                .filter(|(_, pipe)| pipe.device == dev)
                .map(|(&id, _)| id)
                .collect();
            for pid in pipes {
                let Some(handle) = reg.pipes.remove(&pid) else {
                    continue;
                };
                let stale: Vec<UrbId> = reg
                    .urbs
                    .iter()
                    .filter(|(_, urb)| Arc::ptr_eq(urb.pipe(), &handle))
                    .map(|(&id, _)| id)
                    .collect();
                for uid in stale {
                    if let Some(urb) = reg.urbs.remove(&uid) {
                        if urb.state() == UrbState::Ongoing {
                            if let Some(ctl) = inner.controllers.get(handle.controller()) {
                                dequeue.push((Arc::clone(&ctl.ops), urb));
                            }
                        }
                    }
                }
            }

            if let Some(node) = inner.devices.get_mut(&dev) {
                let (bus, address) = (node.controller, node.address);
                if let Some(iface) = node.interfaces.get_mut(usize::from(interface)) {
                    if iface.driver == Some(driver) {
                        iface.driver = None;
                        let kind = match &inner.drivers.get(&driver).unwrap().kind {
                            DriverKind::Internal(handler) => DriverKind::Internal(Arc::clone(handler)),
                            DriverKind::External { events } => DriverKind::External {
                                events: events.clone(),
                            },
                        };
                        notify = Some((kind, bus, address));
                    }
                }
            }
        }

        for (ops, urb) in dequeue {
            let _ = ops.transfer_dequeue(&urb);
        }

        if let Some((kind, bus, address)) = notify {
            match kind {
                DriverKind::Internal(handler) => handler.deletion(bus, address, interface),
                DriverKind::External { events } => {
                    let _ = events.send(DriverMessage::Deletion {
                        bus,
                        address,
                        interface,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(class: u8, vendor: u16, product: u16) -> DeviceDescriptor {
        DeviceDescriptor {
            class,
            vendor,
            product,
            ..Default::default()
        }
    }

    fn interface(class: u8, sub_class: u8, protocol: u8) -> InterfaceDescriptor {
        InterfaceDescriptor {
            class,
            sub_class,
            protocol,
            ..Default::default()
        }
    }

    #[test]
    fn wildcards_match_anything() {
        let filter = DeviceFilter::default();
        let fields = filter
            .matches(&device(0, 0x1234, 0x5678), &interface(8, 6, 0x50))
            .unwrap();
        assert!(fields.is_empty());
    }

    #[test]
    fn class_falls_back_to_the_interface() {
        let filter = DeviceFilter {
            class: Some(8),
            ..Default::default()
        };
        // device class 0 delegates to the interface
        assert!(filter
            .matches(&device(0, 0, 0), &interface(8, 6, 0x50))
            .is_some());
        // a non-zero device class wins over the interface value
        assert!(filter
            .matches(&device(9, 0, 0), &interface(8, 6, 0x50))
            .is_none());
    }

    #[test]
    fn violated_field_voids_the_match() {
        let filter = DeviceFilter {
            vendor: Some(0x1234),
            product: Some(0xAAAA),
            ..Default::default()
        };
        assert!(filter
            .matches(&device(0, 0x1234, 0x5678), &interface(8, 6, 0x50))
            .is_none());
    }

    #[test]
    fn specificity_orders_vendor_product_over_vendor_alone() {
        let loose = DeviceFilter {
            vendor: Some(0x1234),
            ..Default::default()
        };
        let tight = DeviceFilter {
            vendor: Some(0x1234),
            product: Some(0x5678),
            ..Default::default()
        };
        let dev = device(0, 0x1234, 0x5678);
        let iface = interface(8, 6, 0x50);
        let loose_score = loose.matches(&dev, &iface).unwrap().bits().count_ones();
        let tight_score = tight.matches(&dev, &iface).unwrap().bits().count_ones();
        assert!(tight_score > loose_score);
    }
}
