//! USB wire formats.
//!
//! The descriptor layouts and the setup packet are shared between host- and
//! device-mode code; everything here is a plain `#[repr(C, packed)]` view of
//! the bytes a device puts on the bus, validated through the `plain` crate.

pub use self::config::ConfigDescriptor;
pub use self::device::{DeviceDescriptor, DeviceDescriptor8Byte};
pub use self::endpoint::{EndpointDescriptor, EndpointTy, ENDP_ATTR_TY_MASK};
pub use self::hub::{
    HubDescriptor, HubFeature, HubPortFeature, HubPortStatus, HubStatusChange,
};
pub use self::interface::InterfaceDescriptor;
pub use self::setup::{Setup, SetupReq};

pub(crate) mod config;
pub(crate) mod device;
pub(crate) mod endpoint;
pub(crate) mod hub;
pub(crate) mod interface;
pub(crate) mod setup;

/// Device class reported by every hub in its device descriptor.
pub const CLASS_HUB: u8 = 9;

/// Descriptor kinds a device can report. Values are the bDescriptorType
/// assignments of the USB 2.0 specification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DescriptorKind {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    DeviceQualifier = 6,
    OtherSpeedConfiguration = 7,
    Hid = 33,
    Hub = 41,
}
