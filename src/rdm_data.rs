//! In-buffer RDM message codec. Messages are read from and written to the
//! driver slot buffer in place; nothing here allocates.

use crate::consts::{
    PREAMBLE_BYTE, PREAMBLE_LEN_MAX, RDM_EUID_SIZE, RDM_HEADER_SIZE, RDM_MAX_MESSAGE_SIZE,
    RDM_MAX_PDL, SC_RDM, SC_SUB_MESSAGE, SEPARATOR_BYTE,
};
use crate::layouts::rdm_message_layout;
use crate::pids;
use crate::types::{RequestCommandClass, ResponseCommandClass};
use crate::unique_identifier::{PackageAddress, UniqueIdentifier};

/// The decoded 24-byte RDM message header.
///
/// `cc` and `port_id` are kept as raw octets: the dispatcher turns a request
/// into a response by adding one to the command class and replacing the port
/// id with the response type, exactly as the fields travel on the wire.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RdmHeader {
    pub dest_uid: PackageAddress,
    pub src_uid: PackageAddress,
    pub tn: u8,
    /// Port id on requests, response type on responses.
    pub port_id: u8,
    pub message_count: u8,
    pub sub_device: u16,
    /// Raw command class octet.
    pub cc: u8,
    pub pid: u16,
    pub pdl: u8,
}

impl RdmHeader {
    pub fn request_class(&self) -> Option<RequestCommandClass> {
        self.cc.try_into().ok()
    }

    pub fn response_class(&self) -> Option<ResponseCommandClass> {
        self.cc.try_into().ok()
    }

    pub fn is_request(&self) -> bool {
        self.request_class().is_some()
    }
}

pub(crate) fn checksum(data: &[u8]) -> u16 {
    let mut checksum = 0u16;

    for byte in data {
        checksum = checksum.wrapping_add(*byte as u16);
    }

    checksum
}

/// Encode six bytes into the twelve-byte EUID representation used by
/// discovery responses: every byte becomes the pair `(b | 0xAA, b | 0x55)`.
fn encode_euid(src: &[u8], dest: &mut [u8]) {
    debug_assert!(dest.len() >= src.len() * 2);

    for (index, byte) in src.iter().enumerate() {
        dest[index * 2] = byte | 0xAA;
        dest[index * 2 + 1] = byte | 0x55;
    }
}

fn decode_euid(src: &[u8], dest: &mut [u8]) {
    debug_assert!(dest.len() * 2 >= src.len());

    for (index, byte) in src.chunks(2).map(|chunk| chunk[0] & chunk[1]).enumerate() {
        dest[index] = byte;
    }
}

/// Try to decode the header of the message at the start of `buffer`.
///
/// Understands both standard `0xCC 0x01` framed messages and preamble-framed
/// discovery responses (for which a header is synthesized). Returns the
/// header and the total on-wire size of the message, or `None` when the
/// buffer does not begin with a checksum-valid RDM message.
///
/// Called from interrupt context to detect end-of-packet, so it must not
/// read past the message it validates.
pub fn read_header(buffer: &[u8]) -> Option<(RdmHeader, usize)> {
    if buffer.len() < 2 {
        return None;
    }

    if buffer[0] == SC_RDM && buffer[1] == SC_SUB_MESSAGE {
        if buffer.len() < 3 {
            return None;
        }
        let message_len = buffer[2] as usize;
        let total = message_len + 2;
        if message_len < RDM_HEADER_SIZE || total > RDM_MAX_MESSAGE_SIZE || total > buffer.len() {
            return None;
        }

        let expected = checksum(&buffer[..message_len]);
        let actual = u16::from_be_bytes(buffer[message_len..total].try_into().unwrap());
        if expected != actual {
            return None;
        }

        let view = rdm_message_layout::View::new(&buffer[..total]);
        let pdl = view.parameter_data_length().read();
        if message_len != RDM_HEADER_SIZE + pdl as usize || pdl as usize > RDM_MAX_PDL {
            return None;
        }

        let header = RdmHeader {
            dest_uid: PackageAddress::from_bytes(view.destination_uid()),
            src_uid: PackageAddress::from_bytes(view.source_uid()),
            tn: view.transaction_number().read(),
            port_id: view.port_id_response_type().read(),
            message_count: view.message_count().read(),
            sub_device: view.sub_device().read(),
            cc: view.command_class().read(),
            pid: view.parameter_id().read(),
            pdl,
        };

        Some((header, total))
    } else if buffer[0] == PREAMBLE_BYTE || buffer[0] == SEPARATOR_BYTE {
        // Preamble-framed discovery response: up to 7 preamble bytes, a
        // separator, then the 16-byte encoded EUID.
        let preamble_len = buffer
            .iter()
            .take(PREAMBLE_LEN_MAX + 1)
            .position(|&byte| byte == SEPARATOR_BYTE)?;
        let euid = buffer.get(preamble_len + 1..preamble_len + 1 + RDM_EUID_SIZE)?;

        let expected = checksum(&euid[..12]);
        let actual = (((euid[12] & euid[13]) as u16) << 8) | (euid[14] & euid[15]) as u16;
        if expected != actual {
            return None;
        }

        let mut uid_bytes = [0u8; 6];
        decode_euid(&euid[..12], &mut uid_bytes);
        let src_uid = PackageAddress::from_bytes(&uid_bytes);

        let header = RdmHeader {
            dest_uid: PackageAddress::Broadcast,
            src_uid,
            tn: 0,
            port_id: 0,
            message_count: 0,
            sub_device: 0,
            cc: ResponseCommandClass::DiscoveryCommandResponse as u8,
            pid: pids::DISC_UNIQUE_BRANCH,
            pdl: 0,
        };

        Some((header, preamble_len + 1 + RDM_EUID_SIZE))
    } else {
        None
    }
}

/// Slice out the parameter data of the message at the start of `buffer`.
pub fn read_parameter_data(buffer: &[u8]) -> Option<&[u8]> {
    let (header, total) = read_header(buffer)?;
    if total < RDM_HEADER_SIZE {
        return None;
    }

    buffer.get(RDM_HEADER_SIZE..RDM_HEADER_SIZE + header.pdl as usize)
}

/// Serialize an RDM message into `buffer`, filling in message length and
/// checksum. Returns the total number of bytes written.
pub fn write_message(buffer: &mut [u8], header: &RdmHeader, pd: &[u8]) -> usize {
    debug_assert!(pd.len() <= RDM_MAX_PDL);

    let message_len = RDM_HEADER_SIZE + pd.len();
    let total = message_len + 2;

    {
        let mut view = rdm_message_layout::View::new(&mut buffer[..total]);
        view.start_code_mut().write(SC_RDM);
        view.sub_start_code_mut().write(SC_SUB_MESSAGE);
        view.message_length_mut().write(message_len as u8);
        view.destination_uid_mut()
            .copy_from_slice(&header.dest_uid.to_bytes());
        view.source_uid_mut()
            .copy_from_slice(&header.src_uid.to_bytes());
        view.transaction_number_mut().write(header.tn);
        view.port_id_response_type_mut().write(header.port_id);
        view.message_count_mut().write(header.message_count);
        view.sub_device_mut().write(header.sub_device);
        view.command_class_mut().write(header.cc);
        view.parameter_id_mut().write(header.pid);
        view.parameter_data_length_mut().write(pd.len() as u8);
        view.parameter_data_and_checksum_mut()[..pd.len()].copy_from_slice(pd);
    }

    let sum = checksum(&buffer[..message_len]);
    buffer[message_len..total].copy_from_slice(&sum.to_be_bytes());

    total
}

/// Serialize a preamble-framed discovery response into `buffer`. Discovery
/// responses are sent without a break.
pub fn write_discovery_response(buffer: &mut [u8], uid: UniqueIdentifier) -> usize {
    buffer[..PREAMBLE_LEN_MAX].fill(PREAMBLE_BYTE);
    buffer[PREAMBLE_LEN_MAX] = SEPARATOR_BYTE;

    let euid = &mut buffer[PREAMBLE_LEN_MAX + 1..PREAMBLE_LEN_MAX + 1 + RDM_EUID_SIZE];
    encode_euid(&uid.to_bytes(), &mut euid[..12]);

    let sum = checksum(&euid[..12]);
    let sum_bytes = sum.to_be_bytes();
    encode_euid(&sum_bytes, &mut euid[12..16]);

    PREAMBLE_LEN_MAX + 1 + RDM_EUID_SIZE
}
