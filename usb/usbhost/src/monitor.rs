//! Hub monitoring: connect/disconnect detection on every hub in the system.
//!
//! One poll thread covers all hubs. Root hubs have no interrupt endpoint and
//! are sampled through the controller's status query on every timeout tick;
//! external hubs carry a recurring status-interrupt transfer whose completion
//! does nothing but signal the poller's condition — the poller itself reads
//! the status word out of the finished buffer and re-arms the transfer.

use std::mem;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::dev::{DeviceId, HubState, Speed};
use crate::error::{Error, Result};
use crate::stack::UsbStack;
use crate::transfer::{
    DeviceReqData, Direction, Pipe, Recipient, Transfer, TransferKind, UrbState,
};
use crate::usb::{
    EndpointTy, HubDescriptor, HubPortFeature, HubPortStatus, HubStatusChange, Setup,
};

impl UsbStack {
    /// Take ownership of a freshly enumerated hub device: configure it,
    /// learn its port count, power the ports, and start watching it.
    pub(crate) fn hub_add(&self, dev: DeviceId) -> Result<()> {
        let (ep0, config_value, is_root) = {
            let inner = self.inner.lock().unwrap();
            let node = inner.devices.get(&dev).ok_or(Error::NoDevice)?;
            (Arc::clone(&node.ep0), node.config_value, node.parent.is_none())
        };

        self.transfer_sync(
            &ep0,
            Some(Setup::set_configuration(config_value)),
            DeviceReqData::NoData,
        )?;

        let mut desc = HubDescriptor::default();
        self.transfer_sync(
            &ep0,
            Some(Setup::get_hub_descriptor(
                mem::size_of::<HubDescriptor>() as u16
            )),
            DeviceReqData::In(unsafe { plain::as_mut_bytes(&mut desc) }),
        )?;
        let ports = desc.ports.min(self.cfg.max_hub_ports);
        if ports == 0 {
            return Err(Error::Descriptor("hub reports no ports"));
        }

        for port in 1..=ports {
            self.transfer_sync(
                &ep0,
                Some(Setup::set_port_feature(
                    HubPortFeature::PortPower as u16,
                    port,
                )),
                DeviceReqData::NoData,
            )?;
        }

        let status_urb = if is_root {
            None
        } else {
            Some(self.arm_hub_status(dev, ports)?)
        };

        {
            let mut inner = self.inner.lock().unwrap();
            let node = inner.devices.get_mut(&dev).ok_or(Error::NoDevice)?;
            node.hub = Some(HubState {
                is_root,
                ports: vec![None; usize::from(ports)],
                status_urb,
            });
            inner.hubs.push(dev);
        }
        info!("{dev} is a hub with {ports} ports");
        Ok(())
    }

    /// Build and enqueue the first status-interrupt transfer of an external
    /// hub.
    fn arm_hub_status(&self, dev: DeviceId, ports: u8) -> Result<Arc<Transfer>> {
        let (controller, address, endpoint) = {
            let inner = self.inner.lock().unwrap();
            let node = inner.devices.get(&dev).ok_or(Error::NoDevice)?;
            let endpoint = node
                .interfaces
                .iter()
                .flat_map(|iface| iface.endpoints.iter())
                .find(|ep| ep.ty() == EndpointTy::Interrupt && ep.is_in())
                .copied();
            (node.controller, node.address, endpoint)
        };
        let endpoint = endpoint.ok_or(Error::Descriptor("hub has no status interrupt endpoint"))?;

        // One bit per port plus the hub-level bit.
        let len = (usize::from(ports) + 1).div_ceil(8).max(1);
        let buffer = self.pool.alloc(len)?;
        let pipe = Arc::new(Pipe::from_endpoint(controller, dev, address, &endpoint));
        let urb = Arc::new(Transfer::new(
            TransferKind::Interrupt,
            Direction::In,
            true,
            pipe,
            0,
            0,
            Recipient::Hub,
            None,
            Some(buffer),
            len,
        ));
        urb.core.lock().unwrap().state = UrbState::Ongoing;
        self.controller_ops(controller)?.transfer_enqueue(&urb)?;
        Ok(urb)
    }

    /// Stop watching a hub. The poller notices the restart flag and re-scans
    /// from the list head rather than continuing a stale iteration.
    pub(crate) fn hub_remove(&self, dev: DeviceId) {
        let urb = {
            let mut inner = self.inner.lock().unwrap();
            inner.hubs.retain(|&hub| hub != dev);
            inner.hub_scan_restart = true;
            inner
                .devices
                .get_mut(&dev)
                .and_then(|node| node.hub.as_mut())
                .and_then(|hub| hub.status_urb.take())
        };
        if let Some(urb) = urb {
            if urb.state() == UrbState::Ongoing {
                if let Ok(ops) = self.controller_ops(urb.pipe().controller()) {
                    let _ = ops.transfer_dequeue(&urb);
                }
            }
            // Dropping the reference releases the status buffer once the
            // hardware lets go of its own.
        }
    }

    /// Status-change bitmap of one hub, or empty when nothing happened.
    fn hub_status_word(&self, dev: DeviceId) -> HubStatusChange {
        let (is_root, controller, urb) = {
            let inner = self.inner.lock().unwrap();
            let Some(node) = inner.devices.get(&dev) else {
                return HubStatusChange::default();
            };
            let Some(hub) = node.hub.as_ref() else {
                return HubStatusChange::default();
            };
            (
                hub.is_root,
                node.controller,
                hub.status_urb.as_ref().map(Arc::clone),
            )
        };

        if is_root {
            return match self.controller_ops(controller) {
                Ok(ops) => HubStatusChange(ops.roothub_status()),
                Err(_) => HubStatusChange::default(),
            };
        }

        let Some(urb) = urb else {
            return HubStatusChange::default();
        };
        let word = {
            let mut core = urb.core.lock().unwrap();
            if core.state != UrbState::Completed {
                return HubStatusChange::default();
            }
            if let Some(err) = core.error {
                // The hub is failing; its upstream port will report the
                // disconnect. Leave the transfer disarmed.
                debug!("status transfer of {dev} failed: {err}");
                core.state = UrbState::Idle;
                return HubStatusChange::default();
            }
            let transferred = core.transferred.min(core.len);
            let word = core
                .buffer
                .as_ref()
                .map(|buffer| HubStatusChange::from_bitmap(&buffer[..transferred]))
                .unwrap_or_default();
            core.state = UrbState::Ongoing;
            word
        };

        // Re-arm immediately so no change between reads is lost.
        match self.controller_ops(controller) {
            Ok(ops) => {
                if ops.transfer_enqueue(&urb).is_err() {
                    warn!("failed to re-arm status transfer of {dev}");
                    urb.core.lock().unwrap().state = UrbState::Idle;
                }
            }
            Err(_) => {
                urb.core.lock().unwrap().state = UrbState::Idle;
            }
        }
        word
    }

    /// The poll loop. Runs until shutdown on the stack's dedicated hub
    /// thread.
    pub(crate) fn run_hub_poller(&self) {
        loop {
            {
                let guard = self.inner.lock().unwrap();
                let _ = self
                    .hub_event
                    .wait_timeout(guard, Duration::from_millis(self.cfg.poll_interval_ms))
                    .unwrap();
            }
            if self.is_shutdown() {
                return;
            }

            // Handling a change may remove hubs from the list; the restart
            // flag forces a fresh scan instead of touching stale entries.
            'scan: loop {
                let hubs: Vec<DeviceId> = {
                    let mut inner = self.inner.lock().unwrap();
                    inner.hub_scan_restart = false;
                    inner.hubs.clone()
                };
                for hub in hubs {
                    let status = self.hub_status_word(hub);
                    if !status.is_empty() {
                        if status.hub_changed() {
                            debug!("hub-level status change on {hub}");
                        }
                        for port in status.changed_ports() {
                            self.handle_port_change(hub, port);
                        }
                    }
                    if self.inner.lock().unwrap().hub_scan_restart {
                        continue 'scan;
                    }
                }
                break;
            }
        }
    }

    fn handle_port_change(&self, hub: DeviceId, port: u8) {
        let (ep0, controller, occupant) = {
            let inner = self.inner.lock().unwrap();
            let Some(node) = inner.devices.get(&hub) else {
                return;
            };
            let occupant = node
                .hub
                .as_ref()
                .and_then(|h| h.ports.get(usize::from(port) - 1))
                .copied()
                .flatten();
            (Arc::clone(&node.ep0), node.controller, occupant)
        };

        let status = match self.port_status(&ep0, port) {
            Ok(status) => status,
            Err(err) => {
                debug!("port {port} of {hub} unreadable: {err}");
                return;
            }
        };
        self.clear_port_changes(&ep0, port, status);

        if !status.contains(HubPortStatus::CONNECTION_CHANGED) {
            return;
        }

        if status.is_connected() {
            // A device already on the port means it re-announced itself
            // (mode switches do this); enumerate from scratch.
            if let Some(child) = occupant {
                self.disconnect_device(child);
            }
            match self.reset_port(&ep0, port) {
                Ok(after) => {
                    let speed = if after.contains(HubPortStatus::HIGH_SPEED) {
                        Speed::High
                    } else if after.contains(HubPortStatus::LOW_SPEED) {
                        Speed::Low
                    } else {
                        Speed::Full
                    };
                    // Enumeration failure never aborts the scan that
                    // triggered it.
                    let _ = self.attach_device(controller, Some((hub, port)), speed);
                }
                Err(err) => warn!("reset of port {port} on {hub} failed: {err}"),
            }
        } else if let Some(child) = occupant {
            self.disconnect_device(child);
        }
    }

    fn port_status(&self, ep0: &Arc<Pipe>, port: u8) -> Result<HubPortStatus> {
        let mut buf = [0u8; 4];
        let n = self.transfer_sync(
            ep0,
            Some(Setup::get_port_status(port)),
            DeviceReqData::In(&mut buf),
        )?;
        if n < 4 {
            return Err(Error::Descriptor("short port status"));
        }
        Ok(HubPortStatus::from_bits_truncate(u32::from_le_bytes(buf)))
    }

    fn clear_port_changes(&self, ep0: &Arc<Pipe>, port: u8, status: HubPortStatus) {
        for feature in status.changes() {
            let _ = self.transfer_sync(
                ep0,
                Some(Setup::clear_port_feature(feature as u16, port)),
                DeviceReqData::NoData,
            );
        }
    }

    /// Reset a port and wait, with bounded retries, for the reset-complete
    /// change bit.
    fn reset_port(&self, ep0: &Arc<Pipe>, port: u8) -> Result<HubPortStatus> {
        self.transfer_sync(
            ep0,
            Some(Setup::set_port_feature(
                HubPortFeature::PortReset as u16,
                port,
            )),
            DeviceReqData::NoData,
        )?;

        for _ in 0..self.cfg.reset_retries {
            thread::sleep(Duration::from_millis(self.cfg.reset_retry_ms));
            let status = self.port_status(ep0, port)?;
            if status.contains(HubPortStatus::RESET_CHANGED)
                && !status.contains(HubPortStatus::RESET)
            {
                self.clear_port_changes(ep0, port, status);
                return Ok(status);
            }
        }
        Err(Error::ResetTimeout)
    }
}
