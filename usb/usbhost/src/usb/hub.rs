/// Hub class descriptor, as much of it as the stack consumes. The port
/// bitmaps that follow `current` on the wire vary in size and are ignored.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct HubDescriptor {
    pub length: u8,
    pub kind: u8,
    pub ports: u8,
    pub characteristics: u16,
    pub power_on_good: u8,
    pub current: u8,
}

unsafe impl plain::Plain for HubDescriptor {}

impl HubDescriptor {
    pub const DESCRIPTOR_KIND: u8 = 0x29;
}

/// Hub-level feature selectors (recipient: device).
#[derive(Clone, Copy, Debug)]
#[repr(u16)]
pub enum HubFeature {
    CHubLocalPower = 0,
    CHubOverCurrent = 1,
}

/// Port feature selectors (recipient: other).
#[derive(Clone, Copy, Debug)]
#[repr(u16)]
pub enum HubPortFeature {
    PortConnection = 0,
    PortEnable = 1,
    PortSuspend = 2,
    PortOverCurrent = 3,
    PortReset = 4,
    PortPower = 8,
    PortLowSpeed = 9,
    CPortConnection = 16,
    CPortEnable = 17,
    CPortSuspend = 18,
    CPortOverCurrent = 19,
    CPortReset = 20,
}

bitflags::bitflags! {
    /// The combined wPortStatus/wPortChange word returned by GetPortStatus.
    #[derive(Default)]
    #[repr(transparent)]
    pub struct HubPortStatus: u32 {
        const CONNECTION = 1 << 0;
        const ENABLE = 1 << 1;
        const SUSPEND = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET = 1 << 4;
        // bits 5-7 reserved
        const POWER = 1 << 8;
        const LOW_SPEED = 1 << 9;
        const HIGH_SPEED = 1 << 10;
        // bits 11-15 reserved
        const CONNECTION_CHANGED = 1 << 16;
        const ENABLE_CHANGED = 1 << 17;
        const SUSPEND_CHANGED = 1 << 18;
        const OVER_CURRENT_CHANGED = 1 << 19;
        const RESET_CHANGED = 1 << 20;
    }
}

unsafe impl plain::Plain for HubPortStatus {}

impl HubPortStatus {
    pub fn is_connected(&self) -> bool {
        self.contains(Self::CONNECTION)
    }

    pub fn is_enabled(&self) -> bool {
        self.contains(Self::ENABLE)
    }

    /// The change bits, each paired with the feature selector that clears it.
    pub fn changes(&self) -> impl Iterator<Item = HubPortFeature> + '_ {
        [
            (Self::CONNECTION_CHANGED, HubPortFeature::CPortConnection),
            (Self::ENABLE_CHANGED, HubPortFeature::CPortEnable),
            (Self::SUSPEND_CHANGED, HubPortFeature::CPortSuspend),
            (Self::OVER_CURRENT_CHANGED, HubPortFeature::CPortOverCurrent),
            (Self::RESET_CHANGED, HubPortFeature::CPortReset),
        ]
        .into_iter()
        .filter(|(bit, _)| self.contains(*bit))
        .map(|(_, feature)| feature)
    }
}

/// Hub status-change bitmap delivered on the status interrupt pipe (or by the
/// root-hub status query): bit 0 is a hub-level change, bit N a change on
/// port N.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HubStatusChange(pub u32);

impl HubStatusChange {
    pub fn from_bitmap(bytes: &[u8]) -> Self {
        let mut word = 0u32;
        for (i, byte) in bytes.iter().take(4).enumerate() {
            word |= u32::from(*byte) << (8 * i);
        }
        Self(word)
    }

    pub fn hub_changed(&self) -> bool {
        self.0 & 1 != 0
    }

    pub fn changed_ports(&self) -> impl Iterator<Item = u8> + '_ {
        (1..32).filter(|port| self.0 & (1 << port) != 0).map(|p| p as u8)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}
