//! Pipes and transfers (URBs).
//!
//! A [`Transfer`] is the unit of data motion between a driver and the
//! host-controller layer. Drivers in this process block on it (synchronous)
//! or get a completion callback (asynchronous); drivers in other processes
//! get a completion message on their reply channel. Ownership is shared:
//! the driver's URB table, the hardware layer and the completion dispatcher
//! each hold an `Arc`, so a cancel racing a completion can never free the
//! buffer out from under the other side.

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Condvar, Mutex};

use crossbeam_channel::Sender;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use common::pool::DmaChunk;

use crate::dev::DeviceId;
use crate::driver::{DriverId, DriverKind};
use crate::error::{Error, Result, TransferError};
use crate::hcd::{Completion, ControllerId};
use crate::ipc::DriverMessage;
use crate::stack::UsbStack;
use crate::usb::{EndpointDescriptor, EndpointTy, Setup};

pub type PipeId = u32;
pub type UrbId = u32;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum TransferKind {
    Control,
    Interrupt,
    Bulk,
    Isoch,
}

impl From<EndpointTy> for TransferKind {
    fn from(ty: EndpointTy) -> Self {
        match ty {
            EndpointTy::Ctrl => Self::Control,
            EndpointTy::Isoch => Self::Isoch,
            EndpointTy::Bulk => Self::Bulk,
            EndpointTy::Interrupt => Self::Interrupt,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Direction {
    Out,
    In,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UrbState {
    Idle,
    Ongoing,
    Completed,
}

/// Borrowed caller data for a synchronous transfer.
pub enum DeviceReqData<'a> {
    In(&'a mut [u8]),
    Out(&'a [u8]),
    NoData,
}

impl DeviceReqData<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::In(buf) => buf.len(),
            Self::Out(buf) => buf.len(),
            Self::NoData => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn direction(&self) -> Direction {
        match self {
            Self::In(_) => Direction::In,
            Self::Out(_) | Self::NoData => Direction::Out,
        }
    }
}

/// One endpoint of one device, from the host's point of view.
///
/// The record is immutable once built; re-addressing a device during
/// enumeration replaces its endpoint-0 record instead of mutating it, so a
/// transfer always sees the pipe exactly as it was at submission.
pub struct Pipe {
    pub(crate) controller: ControllerId,
    pub(crate) device: DeviceId,
    pub(crate) address: u8,
    /// Endpoint number in bits 0..3, IN bit in bit 7. Zero for control.
    pub(crate) endpoint: u8,
    pub(crate) kind: TransferKind,
    pub(crate) max_packet: u16,
    pub(crate) interval: u8,
    /// Scratch slot for the host-controller layer; never read by the core.
    pub hc_cookie: AtomicU64,
}

impl Pipe {
    pub(crate) fn control(controller: ControllerId, device: DeviceId, address: u8, max_packet: u16) -> Self {
        Self {
            controller,
            device,
            address,
            endpoint: 0,
            kind: TransferKind::Control,
            max_packet,
            interval: 0,
            hc_cookie: AtomicU64::new(0),
        }
    }

    pub(crate) fn from_endpoint(
        controller: ControllerId,
        device: DeviceId,
        address: u8,
        desc: &EndpointDescriptor,
    ) -> Self {
        Self {
            controller,
            device,
            address,
            endpoint: desc.address,
            kind: desc.ty().into(),
            max_packet: desc.max_packet_size,
            interval: desc.interval,
            hc_cookie: AtomicU64::new(0),
        }
    }

    pub fn controller(&self) -> ControllerId {
        self.controller
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Bus address of the device this pipe addresses.
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn endpoint_number(&self) -> u8 {
        self.endpoint & 0x0F
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn direction(&self) -> Direction {
        if self.endpoint & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn max_packet(&self) -> u16 {
        self.max_packet
    }

    pub fn interval(&self) -> u8 {
        self.interval
    }
}

/// Who gets told when a transfer finishes.
pub(crate) enum Recipient {
    /// A driver in this process, or the stack itself (`None`) for the
    /// anonymous transfers enumeration issues. Synchronous callers are woken
    /// through the transfer's condvar; asynchronous completions call the
    /// driver's `completion` handler.
    Internal { driver: Option<DriverId> },
    /// A driver in another process; completions are marshalled onto its
    /// reply channel.
    External {
        driver: DriverId,
        events: Sender<DriverMessage>,
    },
    /// A hub status transfer: completion only signals the hub monitor.
    Hub,
}

pub(crate) struct UrbCore {
    pub state: UrbState,
    pub setup: Option<Setup>,
    pub buffer: Option<DmaChunk>,
    /// Requested transfer length.
    pub len: usize,
    pub transferred: usize,
    pub error: Option<TransferError>,
}

pub struct Transfer {
    pub(crate) kind: TransferKind,
    pub(crate) direction: Direction,
    pub(crate) is_async: bool,
    pub(crate) pipe: Arc<Pipe>,
    /// Id of the pipe in the owning driver's table; 0 for anonymous pipes.
    pub(crate) pipe_id: PipeId,
    /// Id in the owning driver's URB table; 0 for synchronous transfers.
    pub(crate) urb_id: UrbId,
    pub(crate) recipient: Recipient,
    pub(crate) core: Mutex<UrbCore>,
    pub(crate) done: Condvar,
}

impl Transfer {
    pub(crate) fn new(
        kind: TransferKind,
        direction: Direction,
        is_async: bool,
        pipe: Arc<Pipe>,
        pipe_id: PipeId,
        urb_id: UrbId,
        recipient: Recipient,
        setup: Option<Setup>,
        buffer: Option<DmaChunk>,
        len: usize,
    ) -> Self {
        Self {
            kind,
            direction,
            is_async,
            pipe,
            pipe_id,
            urb_id,
            recipient,
            core: Mutex::new(UrbCore {
                state: UrbState::Idle,
                setup,
                buffer,
                len,
                transferred: 0,
                error: None,
            }),
            done: Condvar::new(),
        }
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn pipe(&self) -> &Arc<Pipe> {
        &self.pipe
    }

    pub fn length(&self) -> usize {
        self.core.lock().unwrap().len
    }

    /// Setup packet of a control transfer, as most recently stamped.
    pub fn setup(&self) -> Option<Setup> {
        self.core.lock().unwrap().setup
    }

    /// Device-visible address of the data buffer.
    pub fn buffer_physical(&self) -> Option<usize> {
        self.core.lock().unwrap().buffer.as_ref().map(|b| b.physical())
    }

    /// Copy of the outbound payload. For the hardware layer.
    pub fn out_data(&self) -> Vec<u8> {
        let core = self.core.lock().unwrap();
        match &core.buffer {
            Some(buffer) => buffer[..core.len].to_vec(),
            None => Vec::new(),
        }
    }

    /// Store inbound bytes, returning how many fit. For the hardware layer,
    /// before it reports the completion.
    pub fn fill(&self, bytes: &[u8]) -> usize {
        let mut core = self.core.lock().unwrap();
        let len = core.len;
        match &mut core.buffer {
            Some(buffer) => {
                let n = bytes.len().min(len);
                buffer[..n].copy_from_slice(&bytes[..n]);
                n
            }
            None => 0,
        }
    }

    pub(crate) fn state(&self) -> UrbState {
        self.core.lock().unwrap().state
    }
}

impl UsbStack {
    /// Open a pipe on an interface the driver is bound to.
    ///
    /// Control pipes are cloned from the device's endpoint-0 record; other
    /// kinds resolve to the first endpoint of the interface with a matching
    /// type and direction. Nothing is mutated on failure.
    pub fn pipe_open(
        &self,
        driver: DriverId,
        device: DeviceId,
        interface: u8,
        kind: TransferKind,
        direction: Direction,
    ) -> Result<PipeId> {
        if kind == TransferKind::Isoch {
            return Err(Error::Unsupported);
        }

        let mut inner = self.inner.lock().unwrap();
        let node = inner.devices.get(&device).ok_or(Error::NoDevice)?;
        let iface = node
            .interfaces
            .get(usize::from(interface))
            .ok_or(Error::Invalid("no such interface"))?;
        if iface.driver != Some(driver) {
            return Err(Error::Invalid("interface not bound to this driver"));
        }

        let pipe = if kind == TransferKind::Control {
            let ep0 = &node.ep0;
            Pipe::control(ep0.controller, device, ep0.address, ep0.max_packet)
        } else {
            let desc = iface
                .endpoints
                .iter()
                .find(|ep| {
                    TransferKind::from(ep.ty()) == kind
                        && (ep.is_in()) == (direction == Direction::In)
                })
                .ok_or(Error::Invalid("no matching endpoint"))?;
            Pipe::from_endpoint(node.ep0.controller, device, node.address, desc)
        };

        let reg = inner
            .drivers
            .get_mut(&driver)
            .ok_or(Error::Invalid("unknown driver"))?;
        let id = reg.next_pipe;
        reg.next_pipe += 1;
        reg.pipes.insert(id, Arc::new(pipe));
        Ok(id)
    }

    /// Close a pipe, cancelling and freeing every URB still queued on it.
    pub fn pipe_close(&self, driver: DriverId, pipe: PipeId) -> Result<()> {
        let mut dequeue = Vec::new();
        {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            let reg = inner
                .drivers
                .get_mut(&driver)
                .ok_or(Error::Invalid("unknown driver"))?;
            let handle = reg
                .pipes
                .remove(&pipe)
                .ok_or(Error::Invalid("unknown pipe"))?;

            let stale: Vec<UrbId> = reg
                .urbs
                .iter()
                .filter(|(_, urb)| Arc::ptr_eq(&urb.pipe, &handle))
                .map(|(id, _)| *id)
                .collect();
            for id in stale {
                if let Some(urb) = reg.urbs.remove(&id) {
                    if urb.state() == UrbState::Ongoing {
                        if let Some(ctl) = inner.controllers.get(handle.controller) {
                            dequeue.push((Arc::clone(&ctl.ops), urb));
                        }
                    }
                }
            }
        }
        for (ops, urb) in dequeue {
            let _ = ops.transfer_dequeue(&urb);
        }
        Ok(())
    }

    /// Synchronous transfer on an already-resolved pipe. Blocks the calling
    /// thread until the hardware layer reports completion; the structural
    /// lock is not held while waiting.
    pub(crate) fn transfer_sync(
        &self,
        pipe: &Arc<Pipe>,
        setup: Option<Setup>,
        mut data: DeviceReqData<'_>,
    ) -> Result<usize> {
        let kind = if setup.is_some() {
            TransferKind::Control
        } else {
            pipe.kind
        };
        let direction = match (&setup, &data) {
            (Some(s), DeviceReqData::NoData) => {
                if s.is_in() {
                    Direction::In
                } else {
                    Direction::Out
                }
            }
            (_, d) => d.direction(),
        };

        let len = data.len();
        let buffer = if len > 0 {
            let mut chunk = self.pool.alloc(len)?;
            if let DeviceReqData::Out(bytes) = &data {
                chunk[..len].copy_from_slice(bytes);
            }
            Some(chunk)
        } else {
            None
        };

        let transfer = Arc::new(Transfer::new(
            kind,
            direction,
            false,
            Arc::clone(pipe),
            0,
            0,
            Recipient::Internal { driver: None },
            setup,
            buffer,
            len,
        ));

        let ops = self.controller_ops(pipe.controller)?;
        transfer.core.lock().unwrap().state = UrbState::Ongoing;
        ops.transfer_enqueue(&transfer)?;

        let mut core = transfer.core.lock().unwrap();
        while core.state != UrbState::Completed {
            core = transfer.done.wait(core).unwrap();
        }

        if let Some(error) = core.error {
            return Err(Error::Transfer(error));
        }
        let transferred = core.transferred;
        if let DeviceReqData::In(buf) = &mut data {
            if let Some(buffer) = &core.buffer {
                let n = transferred.min(buf.len());
                buf[..n].copy_from_slice(&buffer[..n]);
            }
        }
        Ok(transferred)
    }

    /// Synchronous transfer on a driver-owned pipe.
    pub fn pipe_transfer_sync(
        &self,
        driver: DriverId,
        pipe: PipeId,
        setup: Option<Setup>,
        data: DeviceReqData<'_>,
    ) -> Result<usize> {
        let handle = self.driver_pipe(driver, pipe)?;
        self.transfer_sync(&handle, setup, data)
    }

    /// Create an asynchronous URB in the driver's table and return its id.
    /// Nothing is handed to hardware yet.
    pub fn urb_create(
        &self,
        driver: DriverId,
        pipe: PipeId,
        setup: Option<Setup>,
        length: usize,
        data: Option<&[u8]>,
    ) -> Result<UrbId> {
        let handle = self.driver_pipe(driver, pipe)?;

        let kind = if setup.is_some() {
            TransferKind::Control
        } else {
            handle.kind
        };
        let direction = match &setup {
            Some(s) if s.is_in() => Direction::In,
            Some(_) => Direction::Out,
            None => handle.direction(),
        };

        let buffer = if length > 0 {
            let mut chunk = self.pool.alloc(length).map_err(|_| {
                debug!("urb allocation failed for driver {driver}");
                Error::NoMemory
            })?;
            if let (Direction::Out, Some(bytes)) = (direction, data) {
                let n = bytes.len().min(length);
                chunk[..n].copy_from_slice(&bytes[..n]);
            }
            Some(chunk)
        } else {
            None
        };

        let mut inner = self.inner.lock().unwrap();
        let reg = inner
            .drivers
            .get_mut(&driver)
            .ok_or(Error::Invalid("unknown driver"))?;
        let recipient = match &reg.kind {
            DriverKind::Internal(_) => Recipient::Internal {
                driver: Some(driver),
            },
            DriverKind::External { events } => Recipient::External {
                driver,
                events: events.clone(),
            },
        };
        let id = reg.next_urb;
        reg.next_urb += 1;
        reg.urbs.insert(
            id,
            Arc::new(Transfer::new(
                kind, direction, true, handle, pipe, id, recipient, setup, buffer, length,
            )),
        );
        Ok(id)
    }

    /// Hand a created URB to the hardware. A fresh setup packet re-stamps
    /// control URBs; outbound data overwrites the buffer.
    pub fn urb_submit(
        &self,
        driver: DriverId,
        urb: UrbId,
        setup: Option<Setup>,
        data: Option<&[u8]>,
    ) -> Result<()> {
        let transfer = self.driver_urb(driver, urb)?;
        let ops = self.controller_ops(transfer.pipe.controller)?;

        {
            let mut core = transfer.core.lock().unwrap();
            if core.state != UrbState::Idle {
                return Err(Error::Busy);
            }
            if transfer.kind == TransferKind::Control {
                if let Some(setup) = setup {
                    core.setup = Some(setup);
                }
            }
            if let (Direction::Out, Some(bytes)) = (transfer.direction, data) {
                let len = core.len;
                if let Some(buffer) = &mut core.buffer {
                    let n = bytes.len().min(len);
                    buffer[..n].copy_from_slice(&bytes[..n]);
                }
            }
            core.state = UrbState::Ongoing;
        }

        if let Err(err) = ops.transfer_enqueue(&transfer) {
            // Immediate reject: roll back so the driver may retry.
            transfer.core.lock().unwrap().state = UrbState::Idle;
            return Err(err);
        }
        Ok(())
    }

    /// Ask the hardware to dequeue an in-flight URB. The completion still
    /// arrives through the normal path, typically reporting
    /// [`TransferError::Aborted`].
    pub fn urb_cancel(&self, driver: DriverId, urb: UrbId) -> Result<()> {
        let transfer = self.driver_urb(driver, urb)?;
        if transfer.state() != UrbState::Ongoing {
            return Err(Error::Invalid("transfer not in flight"));
        }
        let ops = self.controller_ops(transfer.pipe.controller)?;
        ops.transfer_dequeue(&transfer)
    }

    /// Drop the URB from the driver's table. If the hardware still holds a
    /// reference, the buffer lives until that completion fires.
    pub fn urb_free(&self, driver: DriverId, urb: UrbId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let reg = inner
            .drivers
            .get_mut(&driver)
            .ok_or(Error::Invalid("unknown driver"))?;
        reg.urbs
            .remove(&urb)
            .map(drop)
            .ok_or(Error::Invalid("unknown urb"))
    }

    fn driver_pipe(&self, driver: DriverId, pipe: PipeId) -> Result<Arc<Pipe>> {
        let inner = self.inner.lock().unwrap();
        let reg = inner
            .drivers
            .get(&driver)
            .ok_or(Error::Invalid("unknown driver"))?;
        reg.pipes
            .get(&pipe)
            .cloned()
            .ok_or(Error::Invalid("unknown pipe"))
    }

    fn driver_urb(&self, driver: DriverId, urb: UrbId) -> Result<Arc<Transfer>> {
        let inner = self.inner.lock().unwrap();
        let reg = inner
            .drivers
            .get(&driver)
            .ok_or(Error::Invalid("unknown driver"))?;
        reg.urbs
            .get(&urb)
            .cloned()
            .ok_or(Error::Invalid("unknown urb"))
    }

    /// Deliver one completion record from the hardware layer. Runs on the
    /// stack's dispatch thread.
    pub(crate) fn dispatch_completion(&self, completion: Completion) {
        let Completion {
            transfer,
            transferred,
            error,
        } = completion;

        {
            let mut core = transfer.core.lock().unwrap();
            core.transferred = transferred.min(core.len);
            core.error = error;
            // Asynchronous URBs return to idle so the driver can resubmit;
            // synchronous waiters and the hub monitor read the result before
            // releasing theirs.
            core.state = if transfer.is_async && !matches!(&transfer.recipient, Recipient::Hub) {
                UrbState::Idle
            } else {
                UrbState::Completed
            };
        }

        match &transfer.recipient {
            Recipient::Internal { driver: None } => {
                transfer.done.notify_all();
            }
            Recipient::Internal {
                driver: Some(driver),
            } => {
                if !transfer.is_async {
                    transfer.done.notify_all();
                    return;
                }
                let handler = {
                    let inner = self.inner.lock().unwrap();
                    inner.drivers.get(driver).and_then(|reg| match &reg.kind {
                        DriverKind::Internal(handler) => Some(Arc::clone(handler)),
                        DriverKind::External { .. } => None,
                    })
                };
                match handler {
                    Some(handler) => {
                        let (transferred, error) = {
                            let core = transfer.core.lock().unwrap();
                            (core.transferred, core.error)
                        };
                        handler.completion(transfer.pipe_id, transfer.urb_id, transferred, error);
                    }
                    None => debug!("completion for vanished driver {driver}"),
                }
            }
            Recipient::External { driver, events } => {
                let (transferred, error, data) = {
                    let core = transfer.core.lock().unwrap();
                    let data = match (transfer.direction, &core.buffer, core.error) {
                        (Direction::In, Some(buffer), None) => {
                            Some(buffer[..core.transferred].to_vec())
                        }
                        _ => None,
                    };
                    (core.transferred, core.error, data)
                };
                if events
                    .send(DriverMessage::Completion {
                        pipe: transfer.pipe_id,
                        urb: transfer.urb_id,
                        transferred: transferred as u32,
                        error,
                        data,
                    })
                    .is_err()
                {
                    warn!("external driver {driver} dropped its reply channel");
                }
            }
            Recipient::Hub => {
                self.hub_event.notify_all();
            }
        }
    }
}
