use crate::consts::RDM_MAX_PDL;

/// Parameter data of a single RDM message.
pub type DataPack = heapless::Vec<u8, RDM_MAX_PDL>;

/// Command class of an RDM request.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum RequestCommandClass {
    DiscoveryCommand = 0x10,
    GetCommand = 0x20,
    SetCommand = 0x30,
}

/// Command class of an RDM response. Always the request class plus one.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ResponseCommandClass {
    DiscoveryCommandResponse = 0x11,
    GetCommandResponse = 0x21,
    SetCommandResponse = 0x31,
}

impl RequestCommandClass {
    /// Returns the corresponding response class.
    pub fn response_class(&self) -> ResponseCommandClass {
        match self {
            Self::DiscoveryCommand => ResponseCommandClass::DiscoveryCommandResponse,
            Self::GetCommand => ResponseCommandClass::GetCommandResponse,
            Self::SetCommand => ResponseCommandClass::SetCommandResponse,
        }
    }
}

impl TryFrom<u8> for RequestCommandClass {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x10 => Ok(Self::DiscoveryCommand),
            0x20 => Ok(Self::GetCommand),
            0x30 => Ok(Self::SetCommand),
            _ => Err(()),
        }
    }
}

impl TryFrom<u8> for ResponseCommandClass {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x11 => Ok(Self::DiscoveryCommandResponse),
            0x21 => Ok(Self::GetCommandResponse),
            0x31 => Ok(Self::SetCommandResponse),
            _ => Err(()),
        }
    }
}

/// Response status of an RDM response message.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ResponseType {
    Ack = 0x00,
    /// Acknowledged, but the result isn't ready yet.
    AckTimer = 0x01,
    NackReason = 0x02,
    /// Acknowledged, the response spans multiple messages.
    AckOverflow = 0x03,
}

impl TryFrom<u8> for ResponseType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        Ok(match value {
            0x00 => Self::Ack,
            0x01 => Self::AckTimer,
            0x02 => Self::NackReason,
            0x03 => Self::AckOverflow,
            _ => return Err(()),
        })
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum NackReason {
    UnknownPid = 0x0000,
    FormatError = 0x0001,
    HardwareFault = 0x0002,
    ProxyReject = 0x0003,
    WriteProtect = 0x0004,
    UnsupportedCommandClass = 0x0005,
    DataOutOfRange = 0x0006,
    BufferFull = 0x0007,
    PacketSizeUnsupported = 0x0008,
    SubDeviceOutOfRange = 0x0009,
    ProxyBufferFull = 0x000A,
}

impl NackReason {
    pub fn serialize(&self) -> DataPack {
        DataPack::from_slice(&(*self as u16).to_be_bytes()).unwrap()
    }
}

/// Error conditions surfaced by the driver.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum DmxError {
    /// No packet was received within the wait period.
    Timeout = 1,
    /// The UART receive FIFO overflowed.
    DataOverflow = 2,
    /// A slot was received with a framing or parity error.
    ImproperSlot = 3,
    /// The received packet exceeded the driver buffer.
    PacketSize = 4,
    NotInstalled = 5,
    NotEnabled = 6,
    InvalidArg = 7,
}

impl DmxError {
    /// The value carried through the task notification slot by the ISRs.
    pub(crate) fn code(self) -> u32 {
        self as u32
    }

    pub(crate) fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => Self::Timeout,
            2 => Self::DataOverflow,
            3 => Self::ImproperSlot,
            4 => Self::PacketSize,
            5 => Self::NotInstalled,
            6 => Self::NotEnabled,
            7 => Self::InvalidArg,
            _ => return None,
        })
    }
}

impl core::fmt::Display for DmxError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DmxError::Timeout => write!(f, "timed out"),
            DmxError::DataOverflow => write!(f, "receive fifo overflowed"),
            DmxError::ImproperSlot => write!(f, "slot framing error"),
            DmxError::PacketSize => write!(f, "packet exceeds buffer"),
            DmxError::NotInstalled => write!(f, "driver is not installed"),
            DmxError::NotEnabled => write!(f, "driver is not enabled"),
            DmxError::InvalidArg => write!(f, "invalid argument"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for DmxError {}

/// Summary of a received packet, filled by [receive](crate::DmxDriver::receive).
#[derive(Copy, Clone, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Packet {
    /// Start code of the packet, `None` when nothing was received.
    pub sc: Option<u8>,
    /// Error observed while the packet was received, `None` on success.
    pub err: Option<DmxError>,
    /// Number of slots received, including the start code.
    pub size: usize,
    /// True when the packet is a checksum-valid RDM message.
    pub is_rdm: bool,
}

/// Break and mark-after-break timing measured by the sniffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DmxMetadata {
    pub break_us: u32,
    pub mab_us: u32,
}
