//! The device tree and the enumeration state machine.
//!
//! Every device, the root hub included, is a node in an id-keyed arena. A
//! node is created as soon as its port reset succeeds and is filled in
//! incrementally while the enumerator walks the control-transfer sequence;
//! any failure along the way tears the partial node down completely, so a
//! re-triggered attach on the same port starts from a clean slate.

use std::fmt;
use std::mem;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::driver::DriverId;
use crate::error::{Error, Result};
use crate::hcd::ControllerId;
use crate::stack::UsbStack;
use crate::transfer::{DeviceReqData, Pipe, Transfer};
use crate::usb::{
    ConfigDescriptor, DescriptorKind, DeviceDescriptor, DeviceDescriptor8Byte,
    EndpointDescriptor, InterfaceDescriptor, Setup, CLASS_HUB,
};

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Speed {
    Low,
    Full,
    High,
}

/// Position of a device in the hub tree: one 4-bit port number per tier,
/// least significant nibble first. The root hub itself is [`LocationId::ROOT`].
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct LocationId(pub u32);

/// Deepest tier a location id can encode.
pub const MAX_TIER_DEPTH: u8 = 7;

impl LocationId {
    pub const ROOT: Self = Self(0);

    pub fn depth(self) -> u8 {
        let mut depth = 0;
        let mut bits = self.0;
        while bits != 0 {
            bits >>= 4;
            depth += 1;
        }
        depth
    }

    /// Location of the device behind `port` of the hub at this location.
    pub fn child(self, port: u8) -> Result<Self> {
        if port == 0 || port > 0xF {
            return Err(Error::Invalid("port number outside location id range"));
        }
        let depth = self.depth();
        if depth >= MAX_TIER_DEPTH {
            return Err(Error::TooDeep);
        }
        Ok(Self(self.0 | u32::from(port) << (4 * depth)))
    }
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("root");
        }
        let mut bits = self.0;
        let mut first = true;
        while bits != 0 {
            if !first {
                f.write_str(".")?;
            }
            write!(f, "{}", bits & 0xF)?;
            bits >>= 4;
            first = false;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct InterfaceNode {
    pub desc: InterfaceDescriptor,
    pub endpoints: SmallVec<[EndpointDescriptor; 4]>,
    pub string: Option<String>,
    pub driver: Option<DriverId>,
}

/// Hub bookkeeping attached to a device node that turned out to be a hub.
pub(crate) struct HubState {
    pub is_root: bool,
    /// One slot per downstream port; index 0 is port 1.
    pub ports: Vec<Option<DeviceId>>,
    /// Recurring status-interrupt transfer; root hubs have none.
    pub status_urb: Option<Arc<Transfer>>,
}

pub(crate) struct DeviceNode {
    pub id: DeviceId,
    pub controller: ControllerId,
    pub address: u8,
    pub speed: Speed,
    pub location: LocationId,
    pub parent: Option<(DeviceId, u8)>,
    pub desc: DeviceDescriptor,
    /// The raw configuration block, as fetched.
    pub config_raw: Vec<u8>,
    pub config_value: u8,
    pub interfaces: Vec<InterfaceNode>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
    pub ep0: Arc<Pipe>,
    pub hub: Option<HubState>,
}

impl UsbStack {
    /// Build and enumerate a device node for a freshly reset port.
    ///
    /// `parent` is `None` only for the root hub, which already owns reserved
    /// address 1 and skips address negotiation. Failure at any stage
    /// destroys the partial node and everything it acquired.
    pub(crate) fn attach_device(
        &self,
        controller: ControllerId,
        parent: Option<(DeviceId, u8)>,
        speed: Speed,
    ) -> Result<DeviceId> {
        let location = match parent {
            Some((hub, port)) => {
                let inner = self.inner.lock().unwrap();
                let node = inner.devices.get(&hub).ok_or(Error::NoDevice)?;
                node.location.child(port)?
            }
            None => LocationId::ROOT,
        };

        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = DeviceId(inner.next_device);
            inner.next_device += 1;
            let address = if parent.is_none() { 1 } else { 0 };
            let node = DeviceNode {
                id,
                controller,
                address,
                speed,
                location,
                parent,
                desc: DeviceDescriptor::default(),
                config_raw: Vec::new(),
                config_value: 0,
                interfaces: Vec::new(),
                manufacturer: None,
                product: None,
                serial: None,
                ep0: Arc::new(Pipe::control(controller, id, address, 64)),
                hub: None,
            };
            inner.devices.insert(id, node);
            if let Some((hub, port)) = parent {
                let slot = inner
                    .devices
                    .get_mut(&hub)
                    .and_then(|h| h.hub.as_mut())
                    .and_then(|h| h.ports.get_mut(usize::from(port) - 1));
                match slot {
                    Some(slot) => *slot = Some(id),
                    None => {
                        inner.devices.remove(&id);
                        return Err(Error::Invalid("no such hub port"));
                    }
                }
            }
            id
        };

        match self.enumerate(controller, id, parent.is_none()) {
            Ok(()) => {
                info!("enumerated {id} at {location}");
                Ok(id)
            }
            Err(err) => {
                warn!("enumeration of {id} at {location} failed: {err}");
                self.disconnect_device(id);
                Err(err)
            }
        }
    }

    fn enumerate(&self, controller: ControllerId, dev: DeviceId, is_root: bool) -> Result<()> {
        let mut ep0 = {
            let inner = self.inner.lock().unwrap();
            Arc::clone(&inner.devices.get(&dev).ok_or(Error::NoDevice)?.ep0)
        };

        if !is_root {
            // The device answers on the default address with an assumed
            // 64-byte packet size; only the descriptor prefix is safe to
            // fetch until the real packet size is known.
            let mut short = DeviceDescriptor8Byte::default();
            let n = self.fetch_descriptor(
                &ep0,
                DescriptorKind::Device,
                0,
                0,
                unsafe { plain::as_mut_bytes(&mut short) },
            )?;
            if n < mem::size_of::<DeviceDescriptor8Byte>() {
                return Err(Error::Descriptor("short device descriptor prefix"));
            }
            let packet_size = u16::from(short.packet_size).max(8);

            let address = {
                let mut inner = self.inner.lock().unwrap();
                inner
                    .controllers
                    .get_mut(controller)
                    .ok_or(Error::Invalid("unknown controller"))?
                    .addrs
                    .alloc()?
            };
            if let Err(err) =
                self.transfer_sync(&ep0, Some(Setup::set_address(address.into())), DeviceReqData::NoData)
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(ctl) = inner.controllers.get_mut(controller) {
                    ctl.addrs.free(address);
                }
                return Err(err);
            }

            ep0 = Arc::new(Pipe::control(controller, dev, address, packet_size));
            let mut inner = self.inner.lock().unwrap();
            let node = inner.devices.get_mut(&dev).ok_or(Error::NoDevice)?;
            node.address = address;
            node.ep0 = Arc::clone(&ep0);
        }

        // Exactly one re-fetch of the device descriptor, now with the real
        // packet size.
        let mut desc = DeviceDescriptor::default();
        let n = self.fetch_descriptor(
            &ep0,
            DescriptorKind::Device,
            0,
            0,
            unsafe { plain::as_mut_bytes(&mut desc) },
        )?;
        if n < mem::size_of::<DeviceDescriptor>() {
            return Err(Error::Descriptor("short device descriptor"));
        }
        {
            let mut inner = self.inner.lock().unwrap();
            inner.devices.get_mut(&dev).ok_or(Error::NoDevice)?.desc = desc;
        }

        // Configuration: header first to learn the total length, then the
        // whole block, then a structural walk.
        let mut header = ConfigDescriptor::default();
        let n = self.fetch_descriptor(
            &ep0,
            DescriptorKind::Configuration,
            0,
            0,
            unsafe { plain::as_mut_bytes(&mut header) },
        )?;
        if n < mem::size_of::<ConfigDescriptor>() {
            return Err(Error::Descriptor("short configuration header"));
        }
        let total_length = usize::from(header.total_length);
        if total_length < mem::size_of::<ConfigDescriptor>() {
            return Err(Error::Descriptor("configuration shorter than its header"));
        }
        let mut raw = vec![0u8; total_length];
        let fetched =
            self.fetch_descriptor(&ep0, DescriptorKind::Configuration, 0, 0, &mut raw)?;
        if fetched < total_length {
            return Err(Error::Descriptor("truncated configuration block"));
        }
        let (config_value, mut interfaces) = parse_configuration(&raw)?;

        // Strings: index 0 names the language; every zero index means "no
        // such string" and is skipped.
        let str_indices = {
            let d = &desc;
            [d.manufacturer_str, d.product_str, d.serial_str]
        };
        let any_string = str_indices.iter().any(|&i| i > 0)
            || interfaces.iter().any(|i| i.desc.interface_str > 0);
        let language = if any_string {
            self.fetch_language_id(&ep0)?
        } else {
            0
        };
        let mut strings = [None, None, None];
        for (slot, &index) in strings.iter_mut().zip(str_indices.iter()) {
            if index > 0 {
                *slot = Some(self.fetch_string(&ep0, index, language)?);
            }
        }
        for iface in interfaces.iter_mut() {
            let index = iface.desc.interface_str;
            if index > 0 {
                iface.string = Some(self.fetch_string(&ep0, index, language)?);
            }
        }

        {
            let mut inner = self.inner.lock().unwrap();
            let node = inner.devices.get_mut(&dev).ok_or(Error::NoDevice)?;
            node.config_raw = raw;
            node.config_value = config_value;
            node.interfaces = interfaces;
            let [manufacturer, product, serial] = strings;
            node.manufacturer = manufacturer;
            node.product = product;
            node.serial = serial;
        }

        if desc.class == CLASS_HUB {
            self.hub_add(dev)
        } else {
            self.bind_device(dev)
        }
    }

    /// Tear a device (and, recursively, everything behind it) out of the
    /// tree: unbind or hub-remove first, then the descendants, then the node
    /// itself with its pipes, bus address and buffers.
    pub(crate) fn disconnect_device(&self, dev: DeviceId) {
        let (is_hub, bound) = {
            let inner = self.inner.lock().unwrap();
            match inner.devices.get(&dev) {
                Some(node) => (
                    node.hub.is_some(),
                    node.interfaces
                        .iter()
                        .enumerate()
                        .filter_map(|(i, iface)| iface.driver.map(|d| (i as u8, d)))
                        .collect::<Vec<_>>(),
                ),
                None => return,
            }
        };

        if is_hub {
            self.hub_remove(dev);
        }
        for (interface, driver) in bound {
            self.unbind(driver, dev, interface);
        }

        let children: Vec<DeviceId> = {
            let inner = self.inner.lock().unwrap();
            inner
                .devices
                .get(&dev)
                .and_then(|node| node.hub.as_ref())
                .map(|hub| hub.ports.iter().flatten().copied().collect())
                .unwrap_or_default()
        };
        for child in children {
            self.disconnect_device(child);
        }

        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let node = inner.devices.remove(&dev);
            if let Some(node) = &node {
                if let Some((hub, port)) = node.parent {
                    if let Some(slot) = inner
                        .devices
                        .get_mut(&hub)
                        .and_then(|h| h.hub.as_mut())
                        .and_then(|h| h.ports.get_mut(usize::from(port) - 1))
                    {
                        *slot = None;
                    }
                }
            }
            node
        };

        if let Some(node) = removed {
            info!("removed {dev} at {}", node.location);
            if let Ok(ops) = self.controller_ops(node.controller) {
                ops.dev_destroy(node.address, node.location);
            }
            if node.address >= 2 {
                let mut inner = self.inner.lock().unwrap();
                if let Some(ctl) = inner.controllers.get_mut(node.controller) {
                    ctl.addrs.free(node.address);
                }
            }
        }
    }

    pub(crate) fn fetch_descriptor(
        &self,
        ep0: &Arc<Pipe>,
        kind: DescriptorKind,
        index: u8,
        language: u16,
        buf: &mut [u8],
    ) -> Result<usize> {
        let setup = Setup::get_descriptor(kind, index, language, buf.len() as u16);
        self.transfer_sync(ep0, Some(setup), DeviceReqData::In(buf))
    }

    fn fetch_language_id(&self, ep0: &Arc<Pipe>) -> Result<u16> {
        let mut buf = [0u8; 4];
        let n = self.fetch_descriptor(ep0, DescriptorKind::String, 0, 0, &mut buf)?;
        if n < 4 {
            return Err(Error::Descriptor("string language table too short"));
        }
        Ok(u16::from_le_bytes([buf[2], buf[3]]))
    }

    /// Fetch one string descriptor and narrow it by dropping the high byte
    /// of every UTF-16 unit.
    fn fetch_string(&self, ep0: &Arc<Pipe>, index: u8, language: u16) -> Result<String> {
        let mut buf = [0u8; 255];
        let n = self.fetch_descriptor(ep0, DescriptorKind::String, index, language, &mut buf)?;
        if n < 2 {
            return Err(Error::Descriptor("string descriptor too short"));
        }
        let payload = &buf[2..n.min(usize::from(buf[0])).max(2)];
        Ok(payload
            .chunks_exact(2)
            .map(|unit| unit[0] as char)
            .collect())
    }
}

/// Walk a raw configuration block: every interface descriptor opens a new
/// interface; class- and vendor-specific descriptors in between are skipped
/// by scanning forward to the next standard marker; endpoint descriptors
/// attach to the interface that owns them.
pub(crate) fn parse_configuration(raw: &[u8]) -> Result<(u8, Vec<InterfaceNode>)> {
    if raw.len() < mem::size_of::<ConfigDescriptor>() {
        return Err(Error::Descriptor("configuration shorter than its header"));
    }
    let header: &ConfigDescriptor = plain::from_bytes(&raw[..mem::size_of::<ConfigDescriptor>()])
        .map_err(|_| Error::Descriptor("unreadable configuration header"))?;
    if header.kind != DescriptorKind::Configuration as u8 {
        return Err(Error::Descriptor("block does not start with a configuration"));
    }
    let config_value = header.configuration_value;

    let mut interfaces: Vec<InterfaceNode> = Vec::new();
    // Endpoints of alternate settings belong to no materialized interface.
    let mut collecting = false;

    let mut cursor = usize::from(header.length);
    while cursor + 2 <= raw.len() {
        let length = usize::from(raw[cursor]);
        let kind = raw[cursor + 1];
        if length < 2 || cursor + length > raw.len() {
            return Err(Error::Descriptor("descriptor overruns its block"));
        }

        if kind == DescriptorKind::Interface as u8 {
            if length < mem::size_of::<InterfaceDescriptor>() {
                return Err(Error::Descriptor("interface descriptor too short"));
            }
            let desc: InterfaceDescriptor = *plain::from_bytes(
                &raw[cursor..cursor + mem::size_of::<InterfaceDescriptor>()],
            )
            .map_err(|_| Error::Descriptor("unreadable interface descriptor"))?;
            collecting = desc.alternate_setting == 0;
            if collecting {
                interfaces.push(InterfaceNode {
                    desc,
                    endpoints: SmallVec::new(),
                    string: None,
                    driver: None,
                });
            }
        } else if kind == DescriptorKind::Endpoint as u8 && collecting {
            if length < mem::size_of::<EndpointDescriptor>() {
                return Err(Error::Descriptor("endpoint descriptor too short"));
            }
            let desc: EndpointDescriptor = *plain::from_bytes(
                &raw[cursor..cursor + mem::size_of::<EndpointDescriptor>()],
            )
            .map_err(|_| Error::Descriptor("unreadable endpoint descriptor"))?;
            if let Some(iface) = interfaces.last_mut() {
                if iface.endpoints.len() < usize::from(iface.desc.endpoints) {
                    iface.endpoints.push(desc);
                }
            }
        }

        cursor += length;
    }

    Ok((config_value, interfaces))
}
