//! Endpoint vocabulary and the wire-format SETUP header for control
//! transfers.

use serde::{Deserialize, Serialize};

/// The four USB endpoint transfer types.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum EndpointTy {
    Ctrl,
    Isoch,
    Bulk,
    Interrupt,
}

impl EndpointTy {
    /// Whether the endpoint type supports the HALT feature. Only bulk and
    /// interrupt endpoints can be stalled and un-stalled by the host.
    pub fn supports_stall(self) -> bool {
        matches!(self, EndpointTy::Bulk | EndpointTy::Interrupt)
    }
}

/// The direction of a transfer, seen from the host.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

/// Endpoint selector used when matching a transfer configuration against a
/// pipe list.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum EndpointAddr {
    /// Match any endpoint number of the requested type/direction.
    Any,
    /// Match one specific endpoint number.
    Num(u8),
}

impl EndpointAddr {
    pub fn matches(self, num: u8) -> bool {
        match self {
            EndpointAddr::Any => true,
            EndpointAddr::Num(n) => n == num,
        }
    }
}

/// Direction selector for configuration matching. Control pipes carry both
/// directions, so their configurations use `Any`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum DirSpec {
    Any,
    In,
    Out,
}

impl DirSpec {
    pub fn matches(self, dir: Direction) -> bool {
        match self {
            DirSpec::Any => true,
            DirSpec::In => dir == Direction::In,
            DirSpec::Out => dir == Direction::Out,
        }
    }
}

/// Identity of one endpoint direction, as handed to
/// [`UsbBus::attach_pipe`](crate::UsbBus::attach_pipe).
#[derive(Clone, Copy, Debug)]
pub struct EndpointDesc {
    pub number: u8,
    pub ty: EndpointTy,
    pub direction: Direction,
    pub max_packet_size: u16,
}

/// Size of the SETUP header that begins every control transaction.
pub const SETUP_LEN: usize = 8;

pub const USB_SETUP_DIR_BIT: u8 = 1 << 7;
pub const USB_SETUP_RECIPIENT_ENDPOINT: u8 = 2;

/// Feature selector for ClearFeature/SetFeature targeting a halted endpoint.
pub const FEATURE_ENDPOINT_HALT: u16 = 0;

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Setup {
    pub kind: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

unsafe impl plain::Plain for Setup {}

impl Setup {
    pub fn direction(&self) -> Direction {
        if self.kind & USB_SETUP_DIR_BIT == 0 {
            Direction::Out
        } else {
            Direction::In
        }
    }

    pub const fn get_status() -> Self {
        Self {
            kind: 0b1000_0000,
            request: 0x00,
            value: 0,
            index: 0,
            length: 2,
        }
    }

    pub const fn clear_feature(feature: u16) -> Self {
        Self {
            kind: 0b0000_0000,
            request: 0x01,
            value: feature,
            index: 0,
            length: 0,
        }
    }

    /// ClearFeature(ENDPOINT_HALT) addressed at one endpoint; the request a
    /// class driver queues on the default control pipe to un-stall a halted
    /// bulk or interrupt pipe.
    pub const fn clear_feature_halt(endpoint: u8, direction_in: bool) -> Self {
        Self {
            kind: USB_SETUP_RECIPIENT_ENDPOINT,
            request: 0x01,
            value: FEATURE_ENDPOINT_HALT,
            index: (endpoint as u16) | if direction_in { 0x80 } else { 0 },
            length: 0,
        }
    }

    pub const fn set_feature(feature: u16) -> Self {
        Self {
            kind: 0b0000_0000,
            request: 0x03,
            value: feature,
            index: 0,
            length: 0,
        }
    }

    /// Copy the header into the first bytes of a frame buffer.
    pub fn write_to(&self, out: &mut [u8]) {
        let bytes = unsafe { plain::as_bytes(self) };
        out[..SETUP_LEN].copy_from_slice(bytes);
    }

    /// Read a header back out of a frame buffer. Fails when the buffer is
    /// too short to hold one.
    pub fn read_from(buf: &[u8]) -> Option<Self> {
        plain::from_bytes(buf.get(..SETUP_LEN)?).ok().copied()
    }
}
