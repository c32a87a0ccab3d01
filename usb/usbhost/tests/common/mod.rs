//! Shared fixtures: a scripted host controller with in-memory device models.
//!
//! The mock plays the part of the hardware-specific layer: control transfers
//! are answered from descriptor tables, hub class requests manipulate
//! per-port status words, and bulk transfers are parked until the test
//! completes them, exactly like real hardware finishing a queued transfer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use usbhost::{
    CompletionSink, ControllerId, HcOps, InsertionInfo, LocationId, PipeId, Result, Speed,
    Transfer, TransferError, TransferKind, UrbId, UsbDriver,
};

pub const HUB_ADDR_ROOT: u8 = 1;

const CHANGE_MASK: u32 = 0x1F_0000;
const ST_CONNECTION: u32 = 1 << 0;
const ST_ENABLE: u32 = 1 << 1;
const ST_RESET: u32 = 1 << 4;
const ST_POWER: u32 = 1 << 8;
const ST_LOW_SPEED: u32 = 1 << 9;
const ST_HIGH_SPEED: u32 = 1 << 10;
const ST_C_CONNECTION: u32 = 1 << 16;
const ST_C_RESET: u32 = 1 << 20;

/// Template for one emulated device.
#[derive(Clone)]
pub struct MockDeviceModel {
    pub device_desc: Vec<u8>,
    pub config: Vec<u8>,
    pub strings: HashMap<u8, String>,
    pub speed: Speed,
    pub hub_ports: Option<u8>,
    /// Answer every configuration-descriptor fetch with a stall.
    pub fail_config_fetch: bool,
}

pub fn device_descriptor(
    class: u8,
    vendor: u16,
    product: u16,
    strings: [u8; 3],
) -> Vec<u8> {
    let [v0, v1] = vendor.to_le_bytes();
    let [p0, p1] = product.to_le_bytes();
    vec![
        18, 1, 0x00, 0x02, class, 0, 0, 64, v0, v1, p0, p1, 0x01, 0x00, strings[0], strings[1],
        strings[2], 1,
    ]
}

/// Interface spec: (class, sub_class, protocol, endpoints), endpoint spec:
/// (address, attributes, max_packet, interval).
pub fn config_block(value: u8, interfaces: &[(u8, u8, u8, &[(u8, u8, u16, u8)])]) -> Vec<u8> {
    let mut block = vec![9, 2, 0, 0, interfaces.len() as u8, value, 0, 0x80, 50];
    for (number, (class, sub, proto, endpoints)) in interfaces.iter().enumerate() {
        block.extend_from_slice(&[
            9,
            4,
            number as u8,
            0,
            endpoints.len() as u8,
            *class,
            *sub,
            *proto,
            0,
        ]);
        for (address, attributes, max_packet, interval) in endpoints.iter() {
            let [m0, m1] = max_packet.to_le_bytes();
            block.extend_from_slice(&[7, 5, *address, *attributes, m0, m1, *interval]);
        }
    }
    let total = block.len() as u16;
    block[2..4].copy_from_slice(&total.to_le_bytes());
    block
}

/// A vendor-specific function with one bulk IN and one bulk OUT endpoint.
pub fn bulk_device(vendor: u16, product: u16) -> MockDeviceModel {
    let mut strings = HashMap::new();
    strings.insert(1, "Test Widgets Inc".to_owned());
    strings.insert(2, "Bulkomat 3000".to_owned());
    strings.insert(3, "SN-0001".to_owned());
    MockDeviceModel {
        device_desc: device_descriptor(0, vendor, product, [1, 2, 3]),
        config: config_block(1, &[(0xFF, 0, 0, &[(0x81, 2, 64, 0), (0x02, 2, 64, 0)])]),
        strings,
        speed: Speed::High,
        hub_ports: None,
        fail_config_fetch: false,
    }
}

/// An external hub with `ports` downstream ports.
pub fn hub_device(ports: u8) -> MockDeviceModel {
    MockDeviceModel {
        device_desc: device_descriptor(9, 0x0409, 0x0059, [0, 0, 0]),
        config: config_block(1, &[(9, 0, 0, &[(0x81, 3, 1, 12)])]),
        strings: HashMap::new(),
        speed: Speed::High,
        hub_ports: Some(ports),
        fail_config_fetch: false,
    }
}

fn roothub_model(ports: u8) -> MockDeviceModel {
    MockDeviceModel {
        device_desc: device_descriptor(9, 0, 0, [0, 0, 0]),
        config: config_block(1, &[(9, 0, 0, &[])]),
        strings: HashMap::new(),
        speed: Speed::High,
        hub_ports: Some(ports),
        fail_config_fetch: false,
    }
}

struct MockPort {
    status: u32,
    template: Option<MockDeviceModel>,
    /// Bus address of the enumerated occupant.
    assigned: Option<u8>,
    /// Extra status polls before a pending reset reports completion.
    reset_delay: u8,
    reset_countdown: u8,
}

impl MockPort {
    fn new() -> Self {
        Self {
            status: 0,
            template: None,
            assigned: None,
            reset_delay: 0,
            reset_countdown: 0,
        }
    }
}

struct MockDev {
    model: MockDeviceModel,
    configured: bool,
    ports: Vec<MockPort>,
}

impl MockDev {
    fn new(model: MockDeviceModel) -> Self {
        let ports = model.hub_ports.unwrap_or(0);
        Self {
            model,
            configured: false,
            ports: (0..ports).map(|_| MockPort::new()).collect(),
        }
    }

    fn change_bitmap(&self) -> u32 {
        let mut word = 0;
        for (index, port) in self.ports.iter().enumerate() {
            if port.status & CHANGE_MASK != 0 {
                word |= 1 << (index + 1);
            }
        }
        word
    }
}

struct MockState {
    sink: Option<CompletionSink>,
    devices: HashMap<u8, MockDev>,
    /// Device answering on the default address, and the (hub, port) it sits
    /// behind.
    default: Option<(MockDev, (u8, u8))>,
    pending: Vec<Arc<Transfer>>,
    pending_int: Vec<Arc<Transfer>>,
    destroyed: Vec<(u8, LocationId)>,
}

pub struct MockHc {
    state: Mutex<MockState>,
}

impl MockHc {
    pub fn new(root_ports: u8) -> Arc<Self> {
        let mut devices = HashMap::new();
        devices.insert(HUB_ADDR_ROOT, MockDev::new(roothub_model(root_ports)));
        Arc::new(Self {
            state: Mutex::new(MockState {
                sink: None,
                devices,
                default: None,
                pending: Vec::new(),
                pending_int: Vec::new(),
                destroyed: Vec::new(),
            }),
        })
    }

    /// Attach a device model behind `port` of the hub at `hub_addr`
    /// (`HUB_ADDR_ROOT` for the root hub).
    pub fn plug(&self, hub_addr: u8, port: u8, model: MockDeviceModel) {
        let mut state = self.state.lock().unwrap();
        {
            let hub = state.devices.get_mut(&hub_addr).expect("no such hub");
            let port = &mut hub.ports[usize::from(port) - 1];
            port.template = Some(model);
            port.status |= ST_CONNECTION | ST_C_CONNECTION;
        }
        self.hub_interrupt(&mut state, hub_addr);
    }

    pub fn unplug(&self, hub_addr: u8, port: u8) {
        let mut state = self.state.lock().unwrap();
        let assigned = {
            let hub = state.devices.get_mut(&hub_addr).expect("no such hub");
            let port = &mut hub.ports[usize::from(port) - 1];
            port.template = None;
            port.status &= !(ST_CONNECTION | ST_ENABLE | ST_LOW_SPEED | ST_HIGH_SPEED);
            port.status |= ST_C_CONNECTION;
            port.assigned.take()
        };
        if let Some(address) = assigned {
            remove_address(&mut state, address);
        }
        self.hub_interrupt(&mut state, hub_addr);
    }

    pub fn set_reset_delay(&self, hub_addr: u8, port: u8, polls: u8) {
        let mut state = self.state.lock().unwrap();
        let hub = state.devices.get_mut(&hub_addr).expect("no such hub");
        hub.ports[usize::from(port) - 1].reset_delay = polls;
    }

    /// Bulk transfers currently parked in the "hardware".
    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    /// Finish the oldest parked transfer, handing `data` to IN transfers.
    pub fn complete_next(&self, data: &[u8]) -> bool {
        let (sink, transfer) = {
            let mut state = self.state.lock().unwrap();
            if state.pending.is_empty() {
                return false;
            }
            let transfer = state.pending.remove(0);
            (state.sink.clone().unwrap(), transfer)
        };
        let transferred = match transfer.direction() {
            usbhost::Direction::In => transfer.fill(data),
            usbhost::Direction::Out => transfer.length(),
        };
        sink.complete(transfer, transferred, None);
        true
    }

    /// Fail the oldest parked transfer.
    pub fn fail_next(&self, error: TransferError) -> bool {
        let (sink, transfer) = {
            let mut state = self.state.lock().unwrap();
            if state.pending.is_empty() {
                return false;
            }
            let transfer = state.pending.remove(0);
            (state.sink.clone().unwrap(), transfer)
        };
        sink.complete(transfer, 0, Some(error));
        true
    }

    pub fn destroyed(&self) -> Vec<(u8, LocationId)> {
        self.state.lock().unwrap().destroyed.clone()
    }

    /// Complete a parked hub-status interrupt transfer if its hub now has
    /// pending changes.
    fn hub_interrupt(&self, state: &mut MockState, hub_addr: u8) {
        let Some(hub) = state.devices.get(&hub_addr) else {
            return;
        };
        let bitmap = hub.change_bitmap();
        if bitmap == 0 {
            return;
        }
        let position = state
            .pending_int
            .iter()
            .position(|t| t.pipe().address() == hub_addr);
        if let Some(position) = position {
            let transfer = state.pending_int.remove(position);
            let sink = state.sink.clone().unwrap();
            let n = transfer.fill(&bitmap.to_le_bytes());
            sink.complete(transfer, n, None);
        }
    }

    fn handle_control(&self, transfer: &Arc<Transfer>) {
        let setup = transfer.setup().expect("control transfer without setup");
        let address = transfer.pipe().address();
        let (kind, request) = (setup.kind, setup.request);
        let value = setup.value;
        let index = setup.index;
        let length = usize::from(setup.length);

        let mut state = self.state.lock().unwrap();
        let sink = state.sink.clone().unwrap();

        // Resolve the target up front; a vanished device stalls everything.
        let exists = if address == 0 {
            state.default.is_some()
        } else {
            state.devices.contains_key(&address)
        };
        if !exists {
            sink.complete(Arc::clone(transfer), 0, Some(TransferError::TimedOut));
            return;
        }

        match (kind, request) {
            // standard GET_DESCRIPTOR
            (0x80, 6) => {
                let model = if address == 0 {
                    &state.default.as_ref().unwrap().0.model
                } else {
                    &state.devices[&address].model
                };
                let bytes: Option<Vec<u8>> = match (value >> 8) as u8 {
                    1 => Some(model.device_desc.clone()),
                    2 => {
                        if model.fail_config_fetch {
                            sink.complete(Arc::clone(transfer), 0, Some(TransferError::Stall));
                            return;
                        }
                        Some(model.config.clone())
                    }
                    3 => Some(string_descriptor(model, (value & 0xFF) as u8)),
                    _ => None,
                };
                match bytes {
                    Some(bytes) => {
                        let n = transfer.fill(&bytes[..bytes.len().min(length)]);
                        sink.complete(Arc::clone(transfer), n, None);
                    }
                    None => {
                        sink.complete(Arc::clone(transfer), 0, Some(TransferError::Stall));
                    }
                }
            }
            // SET_ADDRESS moves the default device onto the bus
            (0x00, 5) => {
                let new_address = (value & 0x7F) as u8;
                if let Some((dev, (hub_addr, port))) = state.default.take() {
                    state.devices.insert(new_address, dev);
                    if let Some(hub) = state.devices.get_mut(&hub_addr) {
                        hub.ports[usize::from(port) - 1].assigned = Some(new_address);
                    }
                }
                sink.complete(Arc::clone(transfer), 0, None);
            }
            // SET_CONFIGURATION
            (0x00, 9) => {
                if let Some(dev) = state.devices.get_mut(&address) {
                    dev.configured = true;
                }
                sink.complete(Arc::clone(transfer), 0, None);
            }
            // hub class descriptor
            (0xA0, 6) => {
                let ports = state.devices[&address].ports.len() as u8;
                let desc = [9u8, 0x29, ports, 0, 0, 50, 0, 0, 0];
                let n = transfer.fill(&desc[..desc.len().min(length)]);
                sink.complete(Arc::clone(transfer), n, None);
            }
            // GetPortStatus
            (0xA3, 0) => {
                let port_index = usize::from(index) - 1;
                let (status, instantiate) = {
                    let dev = state.devices.get_mut(&address).unwrap();
                    let port = &mut dev.ports[port_index];
                    let mut instantiate = None;
                    if port.reset_countdown > 0 {
                        port.reset_countdown -= 1;
                        if port.reset_countdown == 0 {
                            finish_reset(port);
                            instantiate = port.template.clone().map(|m| (m, index as u8));
                        }
                    }
                    (port.status, instantiate)
                };
                if let Some((model, port)) = instantiate {
                    state.default = Some((MockDev::new(model), (address, port)));
                }
                let n = transfer.fill(&status.to_le_bytes());
                sink.complete(Arc::clone(transfer), n, None);
            }
            // SetPortFeature
            (0x23, 3) => {
                let port_index = usize::from(index) - 1;
                let mut instantiate = None;
                {
                    let dev = state.devices.get_mut(&address).unwrap();
                    let port = &mut dev.ports[port_index];
                    match value {
                        8 => port.status |= ST_POWER,
                        4 => {
                            if port.reset_delay > 0 {
                                port.status |= ST_RESET;
                                port.reset_countdown = port.reset_delay;
                            } else {
                                finish_reset(port);
                            }
                            if port.reset_delay == 0 {
                                instantiate = port.template.clone().map(|m| (m, index as u8));
                            }
                        }
                        _ => {}
                    }
                }
                if let Some((model, port)) = instantiate {
                    state.default = Some((MockDev::new(model), (address, port)));
                }
                sink.complete(Arc::clone(transfer), 0, None);
            }
            // ClearPortFeature
            (0x23, 1) => {
                let port_index = usize::from(index) - 1;
                let dev = state.devices.get_mut(&address).unwrap();
                let port = &mut dev.ports[port_index];
                if (16..=20).contains(&value) {
                    port.status &= !(1 << value);
                }
                sink.complete(Arc::clone(transfer), 0, None);
            }
            // everything else (vendor/class requests to functions) succeeds,
            // zero-filled for IN
            _ => {
                let n = if setup.is_in() {
                    transfer.fill(&vec![0u8; length])
                } else {
                    length
                };
                sink.complete(Arc::clone(transfer), n, None);
            }
        }
    }
}

/// A port reset that has run to completion: device visible, enabled, speed
/// bits valid, change bit set.
fn finish_reset(port: &mut MockPort) {
    port.status &= !(ST_RESET | ST_LOW_SPEED | ST_HIGH_SPEED);
    port.status |= ST_C_RESET;
    if let Some(model) = &port.template {
        port.status |= ST_ENABLE;
        match model.speed {
            Speed::High => port.status |= ST_HIGH_SPEED,
            Speed::Low => port.status |= ST_LOW_SPEED,
            Speed::Full => {}
        }
    }
}

/// Drop a device from the bus, and everything enumerated behind it.
fn remove_address(state: &mut MockState, address: u8) {
    if let Some(dev) = state.devices.remove(&address) {
        for port in dev.ports {
            if let Some(child) = port.assigned {
                remove_address(state, child);
            }
        }
    }
}

fn string_descriptor(model: &MockDeviceModel, index: u8) -> Vec<u8> {
    if index == 0 {
        // language table: en-US
        return vec![4, 3, 0x09, 0x04];
    }
    let text = model.strings.get(&index).cloned().unwrap_or_default();
    let mut bytes = vec![(2 + text.len() * 2) as u8, 3];
    for unit in text.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes
}

impl HcOps for MockHc {
    fn init(&self, sink: CompletionSink) -> Result<()> {
        self.state.lock().unwrap().sink = Some(sink);
        Ok(())
    }

    fn transfer_enqueue(&self, transfer: &Arc<Transfer>) -> Result<()> {
        match transfer.kind() {
            TransferKind::Control => {
                self.handle_control(transfer);
                Ok(())
            }
            TransferKind::Interrupt => {
                let address = transfer.pipe().address();
                let mut state = self.state.lock().unwrap();
                let bitmap = state
                    .devices
                    .get(&address)
                    .map(|dev| dev.change_bitmap())
                    .unwrap_or(0);
                if bitmap != 0 {
                    let sink = state.sink.clone().unwrap();
                    let n = transfer.fill(&bitmap.to_le_bytes());
                    sink.complete(Arc::clone(transfer), n, None);
                } else {
                    state.pending_int.push(Arc::clone(transfer));
                }
                Ok(())
            }
            TransferKind::Bulk => {
                self.state
                    .lock()
                    .unwrap()
                    .pending
                    .push(Arc::clone(transfer));
                Ok(())
            }
            TransferKind::Isoch => Err(usbhost::Error::Unsupported),
        }
    }

    fn transfer_dequeue(&self, transfer: &Arc<Transfer>) -> Result<()> {
        let found = {
            let mut state = self.state.lock().unwrap();
            let mut taken = None;
            if let Some(i) = state.pending.iter().position(|t| Arc::ptr_eq(t, transfer)) {
                taken = Some(state.pending.remove(i));
            } else if let Some(i) = state
                .pending_int
                .iter()
                .position(|t| Arc::ptr_eq(t, transfer))
            {
                taken = Some(state.pending_int.remove(i));
            }
            taken.map(|t| (state.sink.clone().unwrap(), t))
        };
        match found {
            Some((sink, transfer)) => {
                sink.complete(transfer, 0, Some(TransferError::Aborted));
                Ok(())
            }
            None => Err(usbhost::Error::Invalid("transfer not queued")),
        }
    }

    fn dev_destroy(&self, address: u8, location: LocationId) {
        self.state.lock().unwrap().destroyed.push((address, location));
    }

    fn roothub_status(&self) -> u32 {
        self.state.lock().unwrap().devices[&HUB_ADDR_ROOT].change_bitmap()
    }
}

/// Internal driver that records every callback it receives.
#[derive(Default)]
pub struct RecordingDriver {
    pub decline: bool,
    pub insertions: Mutex<Vec<InsertionInfo>>,
    pub deletions: Mutex<Vec<(ControllerId, u8, u8)>>,
    pub completions: Mutex<Vec<(PipeId, UrbId, usize, Option<TransferError>)>>,
}

impl UsbDriver for RecordingDriver {
    fn insertion(&self, info: &InsertionInfo) -> bool {
        self.insertions.lock().unwrap().push(*info);
        !self.decline
    }

    fn deletion(&self, bus: ControllerId, address: u8, interface: u8) {
        self.deletions.lock().unwrap().push((bus, address, interface));
    }

    fn completion(&self, pipe: PipeId, urb: UrbId, transferred: usize, error: Option<TransferError>) {
        self.completions
            .lock()
            .unwrap()
            .push((pipe, urb, transferred, error));
    }
}

/// Spin until `predicate` holds or the deadline passes.
pub fn wait_for(predicate: impl Fn() -> bool, timeout: Duration) -> bool {
    let timeout = ::common::Timeout::new(timeout);
    loop {
        if predicate() {
            return true;
        }
        if timeout.run_spaced(Duration::from_millis(5)).is_err() {
            return predicate();
        }
    }
}

/// A stack config tightened for tests.
pub fn test_config() -> usbhost::StackConfig {
    usbhost::StackConfig::from_toml(
        r#"
        poll_interval_ms = 10
        reset_retry_ms = 5
        insertion_reply_ms = 2000
        "#,
    )
    .unwrap()
}
