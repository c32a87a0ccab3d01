//! Host-side USB stack.
//!
//! USB presents the host with a tree: a host controller whose root hub fans
//! out into ports, hubs that extend the tree downstream, and function
//! devices at the leaves. This crate owns everything between the hardware
//! and the drivers: it watches hubs for hot-plug events, enumerates new
//! devices (address negotiation, descriptor and string fetch), matches every
//! interface against the registered driver filters, and moves data through a
//! reference-counted transfer (URB) abstraction that serves blocking and
//! fire-and-forget submissions alike.
//!
//! Two kinds of collaborators plug into the stack:
//!
//! - a **host controller** implements [`HcOps`] and reports completions
//!   through the [`CompletionSink`] it is handed — the register-level
//!   details (queue heads, transfer descriptors, interrupts) stay entirely
//!   on that side of the trait;
//! - **drivers** either live in this process (implement [`UsbDriver`] and
//!   call the stack directly) or in another one, speaking the message
//!   protocol of [`ipc`] over whatever transport the platform provides.
//!
//! All structural state — device tree, driver registry, pipe and URB tables,
//! bus-address maps — lives in a [`UsbStack`] instance behind one mutex;
//! transfer buffers come from the separately locked DMA chunk pool in the
//! `common` crate.

pub mod dev;
pub mod driver;
pub mod error;
pub mod hcd;
pub mod ipc;
pub mod monitor;
pub mod stack;
pub mod transfer;
pub mod usb;

pub use dev::{DeviceId, LocationId, Speed, MAX_TIER_DEPTH};
pub use driver::{DeviceFilter, DriverId, InsertionInfo, MatchField, UsbDriver};
pub use error::{Error, ErrorCode, Result, TransferError};
pub use hcd::{Completion, CompletionSink, ControllerId, HcOps};
pub use ipc::{
    CtlReq, CtlReqRecipient, CtlReqTy, DeviceInfo, DriverMessage, DriverRequest, HostReply,
    RequestPayload, UrbCmdKind,
};
pub use stack::{start, DeviceSnapshot, InterfaceSnapshot, StackConfig, UsbStack};
pub use transfer::{
    DeviceReqData, Direction, Pipe, PipeId, Transfer, TransferKind, UrbId,
};
