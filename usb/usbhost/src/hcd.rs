//! The boundary to hardware-specific host-controller code.
//!
//! The stack never touches controller registers. A controller implementation
//! registers itself through [`crate::UsbStack::add_controller`] with an
//! [`HcOps`] table, and reports every finished or aborted transfer through
//! the [`CompletionSink`] handed to `init`. The sink is a plain channel, so
//! the hardware side may call it from an interrupt bottom half, a dedicated
//! thread, or inline from `transfer_enqueue`.

use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::dev::{DeviceId, LocationId};
use crate::error::{Result, TransferError};
use crate::transfer::Transfer;

pub type ControllerId = usize;

/// A completion record as delivered by the hardware layer.
pub struct Completion {
    pub transfer: Arc<Transfer>,
    pub transferred: usize,
    pub error: Option<TransferError>,
}

/// Handle the hardware layer uses to report completions into the stack's
/// dispatch thread.
#[derive(Clone)]
pub struct CompletionSink {
    tx: Sender<Completion>,
}

impl CompletionSink {
    pub(crate) fn new(tx: Sender<Completion>) -> Self {
        Self { tx }
    }

    pub fn complete(
        &self,
        transfer: Arc<Transfer>,
        transferred: usize,
        error: Option<TransferError>,
    ) {
        let _ = self.tx.send(Completion {
            transfer,
            transferred,
            error,
        });
    }
}

/// Operations a host-controller implementation must provide.
///
/// `transfer_enqueue` only hands work to the hardware: acceptance means the
/// transfer will eventually come back through the [`CompletionSink`], however
/// it ends. `transfer_dequeue` merely accelerates that completion, typically
/// with [`TransferError::Aborted`].
pub trait HcOps: Send + Sync {
    fn init(&self, sink: CompletionSink) -> Result<()>;

    fn transfer_enqueue(&self, transfer: &Arc<Transfer>) -> Result<()>;

    fn transfer_dequeue(&self, transfer: &Arc<Transfer>) -> Result<()>;

    /// Release per-device controller resources. Called after the device node
    /// and all of its pipes are gone.
    fn dev_destroy(&self, address: u8, location: LocationId);

    /// Status-change bitmap of the root hub: bit 0 hub-level, bit N port N.
    fn roothub_status(&self) -> u32;
}

/// Bus address allocator. One per controller; addresses 0 (the default
/// address every unconfigured device answers on) and 1 (the root hub) are
/// permanently reserved.
pub struct AddressMap {
    bits: [u64; 2],
}

pub const ADDRESS_COUNT: usize = 128;

impl AddressMap {
    pub fn new() -> Self {
        Self {
            // addresses 0 and 1 reserved
            bits: [0b11, 0],
        }
    }

    pub fn alloc(&mut self) -> Result<u8> {
        for (word, bits) in self.bits.iter_mut().enumerate() {
            if *bits != u64::MAX {
                let bit = bits.trailing_ones();
                *bits |= 1 << bit;
                return Ok((word * 64) as u8 + bit as u8);
            }
        }
        Err(crate::error::Error::AddressExhausted)
    }

    /// Return an address. Must only happen after the device and all of its
    /// pipes and transfers are torn down.
    pub fn free(&mut self, address: u8) {
        debug_assert!(self.is_allocated(address));
        self.bits[usize::from(address) / 64] &= !(1 << (address % 64));
    }

    pub fn is_allocated(&self, address: u8) -> bool {
        self.bits[usize::from(address) / 64] & (1 << (address % 64)) != 0
    }
}

impl Default for AddressMap {
    fn default() -> Self {
        Self::new()
    }
}

/// One registered controller.
pub(crate) struct HostController {
    pub ops: Arc<dyn HcOps>,
    pub addrs: AddressMap,
    pub root: Option<DeviceId>,
}
