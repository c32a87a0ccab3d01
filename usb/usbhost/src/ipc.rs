//! The request/reply protocol spoken with drivers in other processes.
//!
//! The transport itself (how bytes move between processes) is someone
//! else's problem: a transport adapter deserializes a [`RequestPayload`],
//! pairs it with reply/event senders and pushes the [`DriverRequest`] into
//! the stack's request channel, where the worker pool executes it against
//! shared state. Every payload type is serde-serializable and round-trips
//! through JSON, which is also the reference wire encoding.

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use crate::dev::LocationId;
use crate::driver::{DeviceFilter, DriverId};
use crate::error::{Error, ErrorCode, Result, TransferError};
use crate::hcd::ControllerId;
use crate::stack::UsbStack;
use crate::transfer::{DeviceReqData, Direction, PipeId, TransferKind, UrbId};
use crate::usb::{DeviceDescriptor, Setup};

/// A control request as marshalled over the driver boundary; the in-memory
/// [`Setup`] packet is assembled host-side from this.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CtlReq {
    pub direction: Direction,
    pub ty: CtlReqTy,
    pub recipient: CtlReqRecipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CtlReqTy {
    Standard,
    Class,
    Vendor,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CtlReqRecipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

impl CtlReq {
    pub fn setup(&self) -> Setup {
        let direction = match self.direction {
            Direction::In => 1u8,
            Direction::Out => 0,
        };
        let ty = match self.ty {
            CtlReqTy::Standard => 0u8,
            CtlReqTy::Class => 1,
            CtlReqTy::Vendor => 2,
        };
        let recipient = match self.recipient {
            CtlReqRecipient::Device => 0u8,
            CtlReqRecipient::Interface => 1,
            CtlReqRecipient::Endpoint => 2,
            CtlReqRecipient::Other => 3,
        };
        Setup {
            kind: direction << 7 | ty << 5 | recipient,
            request: self.request,
            value: self.value,
            index: self.index,
            length: self.length,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum UrbCmdKind {
    Submit,
    Cancel,
    Free,
}

/// Driver-to-host request payloads.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RequestPayload {
    Connect {
        name: String,
        filters: Vec<DeviceFilter>,
    },
    Open {
        driver: u32,
        bus: ControllerId,
        address: u8,
        interface: u8,
        kind: TransferKind,
        direction: Direction,
    },
    /// Synchronous transfer, or creation of an asynchronous URB.
    Urb {
        driver: u32,
        pipe: PipeId,
        r#async: bool,
        ctl: Option<CtlReq>,
        direction: Direction,
        length: u32,
        data: Option<Vec<u8>>,
    },
    UrbCmd {
        driver: u32,
        urb: UrbId,
        cmd: UrbCmdKind,
        ctl: Option<CtlReq>,
        data: Option<Vec<u8>>,
    },
    /// Answer to an [`DriverMessage::Insertion`] offer.
    InsertionReply { token: u64, accept: bool },
}

/// Host-to-driver replies.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum HostReply {
    Connected { driver: u32 },
    PipeOpened { pipe: PipeId },
    UrbCreated { urb: UrbId },
    Transfer {
        transferred: u32,
        data: Option<Vec<u8>>,
    },
    Done,
    Error { code: ErrorCode },
}

/// Unsolicited host-to-driver messages on the driver's event channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DriverMessage {
    Insertion {
        token: u64,
        bus: ControllerId,
        address: u8,
        interface: u8,
        device: DeviceInfo,
        location: LocationId,
    },
    Deletion {
        bus: ControllerId,
        address: u8,
        interface: u8,
    },
    Completion {
        pipe: PipeId,
        urb: UrbId,
        transferred: u32,
        error: Option<TransferError>,
        data: Option<Vec<u8>>,
    },
}

/// Marshallable mirror of the device descriptor carried by insertion offers.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub usb: u16,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub packet_size: u8,
    pub vendor: u16,
    pub product: u16,
    pub release: u16,
}

impl From<&DeviceDescriptor> for DeviceInfo {
    fn from(desc: &DeviceDescriptor) -> Self {
        Self {
            usb: desc.usb,
            class: desc.class,
            sub_class: desc.sub_class,
            protocol: desc.protocol,
            packet_size: desc.packet_size,
            vendor: desc.vendor,
            product: desc.product,
            release: desc.release,
        }
    }
}

macro_rules! json_codec {
    ($ty:ty) => {
        impl $ty {
            pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
                serde_json::to_vec(self)
            }

            pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
                serde_json::from_slice(bytes)
            }
        }
    };
}

json_codec!(RequestPayload);
json_codec!(HostReply);
json_codec!(DriverMessage);

/// One request as it travels inside the host process: the payload plus the
/// channels of the driver that sent it. `events` is only consulted by
/// `Connect`.
pub struct DriverRequest {
    pub payload: RequestPayload,
    pub events: Option<Sender<DriverMessage>>,
    pub reply: Sender<HostReply>,
}

impl UsbStack {
    /// Execute one driver request. Runs synchronously on an IPC worker
    /// thread; a synchronous URB blocks that worker until completion.
    pub(crate) fn handle_request(&self, request: DriverRequest) {
        let DriverRequest {
            payload,
            events,
            reply,
        } = request;

        let result = match payload {
            RequestPayload::Connect { name, filters } => match events {
                Some(events) => {
                    let driver = self.register_external_driver(&name, filters, events);
                    Ok(HostReply::Connected { driver: driver.0 })
                }
                None => Err(Error::Invalid("connect without an event channel")),
            },
            RequestPayload::Open {
                driver,
                bus,
                address,
                interface,
                kind,
                direction,
            } => self
                .device_by_address(bus, address)
                .and_then(|device| {
                    self.pipe_open(DriverId(driver), device, interface, kind, direction)
                })
                .map(|pipe| HostReply::PipeOpened { pipe }),
            RequestPayload::Urb {
                driver,
                pipe,
                r#async,
                ctl,
                direction,
                length,
                data,
            } => self.handle_urb(DriverId(driver), pipe, r#async, ctl, direction, length, data),
            RequestPayload::UrbCmd {
                driver,
                urb,
                cmd,
                ctl,
                data,
            } => {
                let driver = DriverId(driver);
                let setup = ctl.map(|c| c.setup());
                match cmd {
                    UrbCmdKind::Submit => self
                        .urb_submit(driver, urb, setup, data.as_deref())
                        .map(|()| HostReply::Done),
                    UrbCmdKind::Cancel => {
                        self.urb_cancel(driver, urb).map(|()| HostReply::Done)
                    }
                    UrbCmdKind::Free => self.urb_free(driver, urb).map(|()| HostReply::Done),
                }
            }
            RequestPayload::InsertionReply { token, accept } => {
                self.insertion_reply(token, accept);
                Ok(HostReply::Done)
            }
        };

        let message = result.unwrap_or_else(|err| HostReply::Error { code: (&err).into() });
        let _ = reply.send(message);
    }

    fn handle_urb(
        &self,
        driver: DriverId,
        pipe: PipeId,
        r#async: bool,
        ctl: Option<CtlReq>,
        direction: Direction,
        length: u32,
        data: Option<Vec<u8>>,
    ) -> Result<HostReply> {
        let setup = ctl.map(|c| c.setup());
        let length = length as usize;

        if r#async {
            let urb = self.urb_create(driver, pipe, setup, length, data.as_deref())?;
            return Ok(HostReply::UrbCreated { urb });
        }

        match direction {
            Direction::In => {
                let mut buf = vec![0u8; length];
                let transferred =
                    self.pipe_transfer_sync(driver, pipe, setup, DeviceReqData::In(&mut buf))?;
                buf.truncate(transferred);
                Ok(HostReply::Transfer {
                    transferred: transferred as u32,
                    data: Some(buf),
                })
            }
            Direction::Out => {
                let transferred = match &data {
                    Some(bytes) if !bytes.is_empty() => self.pipe_transfer_sync(
                        driver,
                        pipe,
                        setup,
                        DeviceReqData::Out(&bytes[..length.min(bytes.len())]),
                    )?,
                    _ => self.pipe_transfer_sync(driver, pipe, setup, DeviceReqData::NoData)?,
                };
                Ok(HostReply::Transfer {
                    transferred: transferred as u32,
                    data: None,
                })
            }
        }
    }

    fn device_by_address(&self, bus: ControllerId, address: u8) -> Result<crate::dev::DeviceId> {
        let inner = self.inner.lock().unwrap();
        inner
            .devices
            .values()
            .find(|node| node.controller == bus && node.address == address)
            .map(|node| node.id)
            .ok_or(Error::NoDevice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctl_req_packs_the_setup_kind_byte() {
        let req = CtlReq {
            direction: Direction::In,
            ty: CtlReqTy::Class,
            recipient: CtlReqRecipient::Other,
            request: 0,
            value: 0,
            index: 2,
            length: 4,
        };
        let setup = req.setup();
        assert_eq!(setup.kind, 0b1010_0011);
        assert!(setup.is_in());
    }

    #[test]
    fn request_payload_round_trips_through_json() {
        let payload = RequestPayload::Urb {
            driver: 3,
            pipe: 1,
            r#async: true,
            ctl: None,
            direction: Direction::In,
            length: 64,
            data: None,
        };
        let bytes = payload.to_json().unwrap();
        match RequestPayload::from_json(&bytes).unwrap() {
            RequestPayload::Urb {
                driver,
                pipe,
                r#async,
                length,
                ..
            } => {
                assert_eq!((driver, pipe, r#async, length), (3, 1, true, 64));
            }
            other => panic!("decoded the wrong variant: {other:?}"),
        }
    }

    #[test]
    fn completion_message_round_trips_through_json() {
        let message = DriverMessage::Completion {
            pipe: 2,
            urb: 7,
            transferred: 8,
            error: Some(TransferError::Aborted),
            data: Some(vec![1, 2, 3]),
        };
        let bytes = message.to_json().unwrap();
        match DriverMessage::from_json(&bytes).unwrap() {
            DriverMessage::Completion {
                pipe,
                urb,
                transferred,
                error,
                data,
            } => {
                assert_eq!((pipe, urb, transferred), (2, 7, 8));
                assert_eq!(error, Some(TransferError::Aborted));
                assert_eq!(data, Some(vec![1, 2, 3]));
            }
            other => panic!("decoded the wrong variant: {other:?}"),
        }
    }
}
