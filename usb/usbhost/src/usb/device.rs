/// The device descriptor: the information that applies to a device as a
/// whole, independent of which configuration is selected.
///
/// A class of 0 means the class is defined per interface, which is what the
/// driver matcher keys on.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub kind: u8,
    /// USB release in binary-coded decimal (0x0200 for 2.0).
    pub usb: u16,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    /// Max packet size of endpoint 0.
    pub packet_size: u8,
    pub vendor: u16,
    pub product: u16,
    pub release: u16,
    pub manufacturer_str: u8,
    pub product_str: u8,
    pub serial_str: u8,
    pub configurations: u8,
}

unsafe impl plain::Plain for DeviceDescriptor {}

/// The first eight bytes of [`DeviceDescriptor`].
///
/// Before a device has a real address the stack talks to it with a guessed
/// 64-byte max packet size; this prefix is all that can be fetched safely,
/// and it carries the actual `packet_size` used for every later request.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDescriptor8Byte {
    pub length: u8,
    pub kind: u8,
    pub usb: u16,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub packet_size: u8,
}

unsafe impl plain::Plain for DeviceDescriptor8Byte {}
