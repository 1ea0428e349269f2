pub const DMX_NULL_START: u8 = 0x00;
/// start code + 512 slots
pub const DMX_MAX_PACKET_SIZE: usize = 513;
pub const SC_RDM: u8 = 0xCC;
pub const SC_SUB_MESSAGE: u8 = 0x01;

pub const PREAMBLE_BYTE: u8 = 0xFE;
pub const SEPARATOR_BYTE: u8 = 0xAA;
/// A discovery response may be preceded by at most 7 preamble bytes.
pub const PREAMBLE_LEN_MAX: usize = 7;

pub const BROADCAST_UID: u64 = 0xFFFF_FFFFFFFF;

pub const DMX_BAUD_RATE: u32 = 250_000;
pub const DMX_BAUD_RATE_MIN: u32 = 245_000;
pub const DMX_BAUD_RATE_MAX: u32 = 255_000;

pub const DMX_BREAK_LEN_DEFAULT_US: u32 = 176;
pub const DMX_BREAK_LEN_MIN_US: u32 = 92;
pub const DMX_BREAK_LEN_MAX_US: u32 = 176;
pub const DMX_MAB_LEN_DEFAULT_US: u32 = 12;
pub const DMX_MAB_LEN_MIN_US: u32 = 12;
pub const DMX_MAB_LEN_MAX_US: u32 = 88;

/// 24-byte header: start code through PDL field.
pub const RDM_HEADER_SIZE: usize = 24;
pub const RDM_MAX_PDL: usize = 231;
/// Header, parameter data and checksum of the largest legal RDM message.
pub const RDM_MAX_MESSAGE_SIZE: usize = RDM_HEADER_SIZE + RDM_MAX_PDL + 2;
/// Encoded EUID plus encoded checksum.
pub const RDM_EUID_SIZE: usize = 16;
/// Worst-case discovery response: full preamble, separator and EUID.
pub const RDM_DISCOVERY_RESPONSE_SIZE: usize = PREAMBLE_LEN_MAX + 1 + RDM_EUID_SIZE;

pub const SUB_DEVICE_ROOT: u16 = 0x0000;
pub const SUB_DEVICE_ALL: u16 = 0xFFFF;

// RDM inter-packet timing (ANSI E1.20 table 3-2).
pub const RDM_CONTROLLER_RESPONSE_LOST_TIMEOUT_US: u32 = 2800;
pub const RDM_RESPONDER_RESPONSE_LOST_TIMEOUT_US: u32 = 2000;
pub const RDM_DISCOVERY_NO_RESPONSE_PACKET_SPACING_US: u32 = 5800;
pub const RDM_REQUEST_NO_RESPONSE_PACKET_SPACING_US: u32 = 3000;
pub const RDM_BROADCAST_PACKET_SPACING_US: u32 = 176;
pub const RDM_RESPOND_TO_REQUEST_PACKET_SPACING_US: u32 = 176;

/// Capacity of the per-port parameter table.
pub const RDM_RESPONDER_PIDS_MAX: usize = 32;
/// Capacity of the per-port parameter data slab.
pub const RDM_PD_SLAB_SIZE: usize = 512;
/// Capacity of the per-port queued message list.
pub const RDM_QUEUE_SIZE_MAX: usize = 64;

/// Pass as a wait argument to block without a deadline.
pub const WAIT_FOREVER: u32 = u32::MAX;

/// Spacing and turnaround waits are bounded by the time a full DMX packet
/// plus reset sequence occupies the wire.
pub(crate) const DMX_PACKET_TIMEOUT_US: u32 = 23_000;
