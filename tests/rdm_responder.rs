mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use dmx_rdm_uart::consts::RDM_HEADER_SIZE;
use dmx_rdm_uart::pids;
use dmx_rdm_uart::rdm_data::{self, RdmHeader};
use dmx_rdm_uart::types::{Packet, RequestCommandClass, ResponseType};
use dmx_rdm_uart::unique_identifier::{PackageAddress, UniqueIdentifier};
use dmx_rdm_uart::DmxConfig;

use common::{install_driver, TestBus, NVS_WRITES};

fn own_uid() -> UniqueIdentifier {
    UniqueIdentifier::new(0x7FF0, 0x12345678).unwrap()
}

fn controller_uid() -> UniqueIdentifier {
    UniqueIdentifier::new(0x0011, 0x22334455).unwrap()
}

fn config() -> DmxConfig {
    DmxConfig {
        uid: own_uid(),
        dmx_footprint: 4,
        dmx_start_address: 1,
        software_version_label: "test fixture",
        ..DmxConfig::default()
    }
}

fn request(
    cc: RequestCommandClass,
    dest: PackageAddress,
    sub_device: u16,
    pid: u16,
    pd: &[u8],
) -> Vec<u8> {
    let header = RdmHeader {
        dest_uid: dest,
        src_uid: PackageAddress::Device(controller_uid()),
        tn: 3,
        port_id: 1,
        message_count: 0,
        sub_device,
        cc: cc as u8,
        pid,
        pdl: pd.len() as u8,
    };

    let mut buffer = [0u8; 300];
    let total = rdm_data::write_message(&mut buffer, &header, pd);
    buffer[..total].to_vec()
}

/// Runs one request through `receive` and collects whatever the responder
/// put on the wire.
fn exchange(bus: &TestBus, request: &[u8]) -> (usize, Packet, Vec<u8>) {
    bus.uart.clear_wire();

    let done = AtomicBool::new(false);
    let (size, packet) = thread::scope(|s| {
        let handle = s.spawn(|| {
            let mut packet = Packet::default();
            let size = bus.driver.receive(0, Some(&mut packet), 1_000_000);
            done.store(true, Ordering::SeqCst);
            (size, packet)
        });

        thread::sleep(Duration::from_millis(2));
        bus.inject_frame(request);
        bus.service_until(|| done.load(Ordering::SeqCst));

        handle.join().unwrap()
    });

    (size, packet, bus.uart.wire())
}

#[test]
fn get_device_info_is_answered() {
    let bus = install_driver(&config());

    let request = request(
        RequestCommandClass::GetCommand,
        PackageAddress::Device(own_uid()),
        0,
        pids::DEVICE_INFO,
        &[],
    );
    let (size, packet, wire) = exchange(&bus, &request);

    assert_eq!(size, request.len());
    assert!(packet.is_rdm);
    assert_eq!(packet.err, None);

    let (header, total) = rdm_data::read_header(&wire).expect("response must parse");
    assert_eq!(header.cc, 0x21); // GET_COMMAND_RESPONSE
    assert_eq!(header.pdl, 19);
    assert_eq!(header.tn, 3);
    assert_eq!(header.port_id, ResponseType::Ack as u8);
    assert_eq!(header.dest_uid, PackageAddress::Device(controller_uid()));
    assert_eq!(header.src_uid, PackageAddress::Device(own_uid()));
    assert_eq!(total, wire.len());

    let pd = &wire[RDM_HEADER_SIZE..RDM_HEADER_SIZE + 19];
    assert_eq!(&pd[..2], &[0x01, 0x00]); // protocol version
    assert_eq!(&pd[10..12], &[0, 4]); // footprint
    assert_eq!(&pd[14..16], &[0, 1]); // start address

    // The responder is back to listening for the next request.
    assert!(bus.uart.rts_listen());
}

#[test]
fn broadcast_requests_are_answered_silently() {
    let bus = install_driver(&config());

    let request = request(
        RequestCommandClass::SetCommand,
        PackageAddress::Broadcast,
        0,
        pids::IDENTIFY_DEVICE,
        &[1],
    );
    let (size, packet, wire) = exchange(&bus, &request);

    assert_eq!(size, request.len());
    assert!(packet.is_rdm);
    // The handler ran and mutated the parameter, but no response went out.
    assert!(wire.is_empty());

    let mut identify = [0u8; 1];
    assert_eq!(
        bus.driver.rdm_parameter_read(0, pids::IDENTIFY_DEVICE, &mut identify),
        1
    );
    assert_eq!(identify, [1]);
}

#[test]
fn unknown_pid_is_nacked() {
    let bus = install_driver(&config());

    let request = request(
        RequestCommandClass::GetCommand,
        PackageAddress::Device(own_uid()),
        0,
        0x1234,
        &[],
    );
    let (_, _, wire) = exchange(&bus, &request);

    let (header, _) = rdm_data::read_header(&wire).expect("nack must parse");
    assert_eq!(header.port_id, ResponseType::NackReason as u8);
    assert_eq!(header.pdl, 2);
    assert_eq!(header.pid, 0x1234);
    // NR_UNKNOWN_PID
    assert_eq!(&wire[RDM_HEADER_SIZE..RDM_HEADER_SIZE + 2], &[0x00, 0x00]);
}

#[test]
fn sub_device_requests_are_rejected() {
    let bus = install_driver(&config());

    let request = request(
        RequestCommandClass::GetCommand,
        PackageAddress::Device(own_uid()),
        5,
        pids::DEVICE_INFO,
        &[],
    );
    let (_, _, wire) = exchange(&bus, &request);

    let (header, _) = rdm_data::read_header(&wire).expect("nack must parse");
    assert_eq!(header.port_id, ResponseType::NackReason as u8);
    // NR_SUB_DEVICE_OUT_OF_RANGE
    assert_eq!(&wire[RDM_HEADER_SIZE..RDM_HEADER_SIZE + 2], &[0x00, 0x09]);
}

#[test]
fn discovery_is_answered_with_a_preamble_frame() {
    let bus = install_driver(&config());

    let mut pd = [0u8; 12];
    pd[6..12].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFE]);
    let request = request(
        RequestCommandClass::DiscoveryCommand,
        PackageAddress::Broadcast,
        0,
        pids::DISC_UNIQUE_BRANCH,
        &pd,
    );
    let (_, packet, wire) = exchange(&bus, &request);

    assert!(packet.is_rdm);
    assert_eq!(wire[0], 0xFE); // preamble, no break precedes it

    let (header, total) = rdm_data::read_header(&wire).expect("euid frame must parse");
    assert_eq!(total, wire.len());
    assert_eq!(header.src_uid, PackageAddress::Device(own_uid()));
    assert_eq!(header.pid, pids::DISC_UNIQUE_BRANCH);
    assert_eq!(header.cc, 0x11); // DISC_COMMAND_RESPONSE
}

#[test]
fn discovery_out_of_range_stays_silent() {
    let bus = install_driver(&config());

    // Range below our uid.
    let mut pd = [0u8; 12];
    pd[6..12].copy_from_slice(&[0x00, 0x01, 0, 0, 0, 0]);
    let request = request(
        RequestCommandClass::DiscoveryCommand,
        PackageAddress::Broadcast,
        0,
        pids::DISC_UNIQUE_BRANCH,
        &pd,
    );
    let (size, _, wire) = exchange(&bus, &request);

    assert_eq!(size, request.len());
    assert!(wire.is_empty());
}

#[test]
fn mute_suppresses_discovery_until_unmuted() {
    let bus = install_driver(&config());

    // Unicast mute is acknowledged with the control field.
    let mute = request(
        RequestCommandClass::DiscoveryCommand,
        PackageAddress::Device(own_uid()),
        0,
        pids::DISC_MUTE,
        &[],
    );
    let (_, _, wire) = exchange(&bus, &mute);
    let (header, _) = rdm_data::read_header(&wire).expect("mute response must parse");
    assert_eq!(header.port_id, ResponseType::Ack as u8);
    assert_eq!(header.pdl, 2);
    assert!(bus.driver.rdm_discovery_is_muted(0));

    // A muted responder ignores DISC_UNIQUE_BRANCH.
    let mut pd = [0u8; 12];
    pd[6..12].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFE]);
    let disc = request(
        RequestCommandClass::DiscoveryCommand,
        PackageAddress::Broadcast,
        0,
        pids::DISC_UNIQUE_BRANCH,
        &pd,
    );
    let (_, _, wire) = exchange(&bus, &disc);
    assert!(wire.is_empty());

    // Broadcast un-mute: applied, not answered.
    let unmute = request(
        RequestCommandClass::DiscoveryCommand,
        PackageAddress::Broadcast,
        0,
        pids::DISC_UN_MUTE,
        &[],
    );
    let (_, _, wire) = exchange(&bus, &unmute);
    assert!(wire.is_empty());
    assert!(!bus.driver.rdm_discovery_is_muted(0));
}

#[test]
fn set_dmx_start_address_updates_device_info_and_nvs() {
    let bus = install_driver(&config());
    NVS_WRITES.lock().unwrap().clear();

    let set = request(
        RequestCommandClass::SetCommand,
        PackageAddress::Device(own_uid()),
        0,
        pids::DMX_START_ADDRESS,
        &[0, 42],
    );
    let (_, _, wire) = exchange(&bus, &set);
    let (header, _) = rdm_data::read_header(&wire).expect("set response must parse");
    assert_eq!(header.port_id, ResponseType::Ack as u8);
    assert_eq!(header.cc, 0x31); // SET_COMMAND_RESPONSE
    assert_eq!(header.pdl, 0);

    // The alias shares storage with DEVICE_INFO.
    let get = request(
        RequestCommandClass::GetCommand,
        PackageAddress::Device(own_uid()),
        0,
        pids::DEVICE_INFO,
        &[],
    );
    let (_, _, wire) = exchange(&bus, &get);
    assert_eq!(&wire[RDM_HEADER_SIZE + 14..RDM_HEADER_SIZE + 16], &[0, 42]);

    // The accepted SET was persisted through the platform hook.
    let writes = NVS_WRITES.lock().unwrap();
    assert!(writes.contains(&(pids::DMX_START_ADDRESS, vec![0, 42])));
}

#[test]
fn out_of_range_start_address_is_nacked() {
    let bus = install_driver(&config());

    let set = request(
        RequestCommandClass::SetCommand,
        PackageAddress::Device(own_uid()),
        0,
        pids::DMX_START_ADDRESS,
        &[0xFF, 0xFF],
    );
    let (_, _, wire) = exchange(&bus, &set);

    let (header, _) = rdm_data::read_header(&wire).expect("nack must parse");
    assert_eq!(header.port_id, ResponseType::NackReason as u8);
    // NR_DATA_OUT_OF_RANGE
    assert_eq!(&wire[RDM_HEADER_SIZE..RDM_HEADER_SIZE + 2], &[0x00, 0x06]);
}

#[test]
fn queued_pids_show_up_as_message_count() {
    let bus = install_driver(&config());

    assert_eq!(bus.driver.rdm_queue_push(0, pids::IDENTIFY_DEVICE), Some(0));
    assert_eq!(bus.driver.rdm_queue_push(0, pids::DMX_START_ADDRESS), Some(1));
    // Queueing an already-pending PID keeps its index.
    assert_eq!(bus.driver.rdm_queue_push(0, pids::IDENTIFY_DEVICE), Some(0));
    assert_eq!(bus.driver.rdm_queue_size(0), 2);

    let mut pending = [0u16; 4];
    assert_eq!(bus.driver.rdm_queue_list(0, &mut pending), 2);
    assert_eq!(&pending[..2], &[pids::IDENTIFY_DEVICE, pids::DMX_START_ADDRESS]);

    let get = request(
        RequestCommandClass::GetCommand,
        PackageAddress::Device(own_uid()),
        0,
        pids::DEVICE_INFO,
        &[],
    );
    let (_, _, wire) = exchange(&bus, &get);
    let (header, _) = rdm_data::read_header(&wire).unwrap();
    assert_eq!(header.message_count, 2);
}

#[test]
fn supported_parameters_lists_registered_pids() {
    let bus = install_driver(&config());

    let get = request(
        RequestCommandClass::GetCommand,
        PackageAddress::Device(own_uid()),
        0,
        pids::SUPPORTED_PARAMETERS,
        &[],
    );
    let (_, _, wire) = exchange(&bus, &get);

    let (header, _) = rdm_data::read_header(&wire).unwrap();
    assert_eq!(header.port_id, ResponseType::Ack as u8);

    let pd = &wire[RDM_HEADER_SIZE..RDM_HEADER_SIZE + header.pdl as usize];
    let listed: Vec<u16> = pd
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();

    assert!(listed.contains(&pids::DEVICE_INFO));
    assert!(listed.contains(&pids::DMX_START_ADDRESS));
    assert!(listed.contains(&pids::IDENTIFY_DEVICE));
    assert!(listed.contains(&pids::SOFTWARE_VERSION_LABEL));
    // Discovery PIDs are never listed.
    assert!(!listed.contains(&pids::DISC_UNIQUE_BRANCH));
    assert!(!listed.contains(&pids::DISC_MUTE));
}

#[test]
fn software_version_label_is_served_from_storage() {
    let bus = install_driver(&config());

    let get = request(
        RequestCommandClass::GetCommand,
        PackageAddress::Device(own_uid()),
        0,
        pids::SOFTWARE_VERSION_LABEL,
        &[],
    );
    let (_, _, wire) = exchange(&bus, &get);

    let (header, _) = rdm_data::read_header(&wire).unwrap();
    assert_eq!(header.port_id, ResponseType::Ack as u8);
    assert_eq!(
        &wire[RDM_HEADER_SIZE..RDM_HEADER_SIZE + header.pdl as usize],
        b"test fixture"
    );
}
