mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use dmx_rdm_uart::consts::{
    DMX_BREAK_LEN_DEFAULT_US, DMX_MAB_LEN_DEFAULT_US,
    RDM_CONTROLLER_RESPONSE_LOST_TIMEOUT_US, RDM_DISCOVERY_NO_RESPONSE_PACKET_SPACING_US,
};
use dmx_rdm_uart::pids;
use dmx_rdm_uart::rdm_data::{self, RdmHeader};
use dmx_rdm_uart::types::{DmxError, DmxMetadata, Packet, RequestCommandClass};
use dmx_rdm_uart::unique_identifier::{PackageAddress, UniqueIdentifier};
use dmx_rdm_uart::DmxConfig;

use common::install_driver;

fn own_uid() -> UniqueIdentifier {
    UniqueIdentifier::new(0x7FF0, 0x12345678).unwrap()
}

fn controller_uid() -> UniqueIdentifier {
    UniqueIdentifier::new(0x0011, 0x22334455).unwrap()
}

fn config() -> DmxConfig {
    DmxConfig {
        uid: own_uid(),
        ..DmxConfig::default()
    }
}

/// A DISC_UNIQUE_BRANCH request over the full uid range.
fn disc_unique_branch_request() -> Vec<u8> {
    let mut pd = [0u8; 12];
    pd[5] = 0x01;
    pd[6..12].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFE]);

    let header = RdmHeader {
        dest_uid: PackageAddress::Broadcast,
        src_uid: PackageAddress::Device(controller_uid()),
        tn: 1,
        port_id: 1,
        message_count: 0,
        sub_device: 0,
        cc: RequestCommandClass::DiscoveryCommand as u8,
        pid: pids::DISC_UNIQUE_BRANCH,
        pdl: 12,
    };

    let mut buffer = [0u8; 64];
    let total = rdm_data::write_message(&mut buffer, &header, &pd);
    buffer[..total].to_vec()
}

#[test]
fn basic_tx_shapes_break_mab_and_data() {
    let bus = install_driver(&config());
    assert!(bus.uart.rts_listen());

    assert_eq!(bus.driver.write(0, &[0x00, 255, 128, 0]), 4);
    // Writing turns the bus around to drive.
    assert!(!bus.uart.rts_listen());

    assert_eq!(bus.driver.send(0, 4), 4);

    // The reset sequence starts with the break: line low, timer armed.
    assert!(bus.timer.is_running());
    assert_eq!(bus.timer.alarm(), DMX_BREAK_LEN_DEFAULT_US as u64);
    assert!(bus.uart.tx_inverted());
    assert!(bus.uart.wire().is_empty());

    // Break alarm: line idles high for the mark-after-break.
    bus.driver.on_timer_interrupt(0);
    assert!(!bus.uart.tx_inverted());
    assert_eq!(bus.timer.alarm(), DMX_MAB_LEN_DEFAULT_US as u64);

    // Mark-after-break alarm: data is handed to the UART.
    bus.driver.on_timer_interrupt(0);
    assert!(!bus.timer.is_running());
    assert_eq!(bus.uart.wire(), vec![0x00, 255, 128, 0]);

    // TX done: the driver reports idle.
    bus.driver.on_uart_interrupt(0);
    assert!(bus.driver.wait_sent(0, 100_000));
}

#[test]
fn basic_rx_delivers_a_short_frame() {
    let bus = install_driver(&config());

    let (size, packet) = thread::scope(|s| {
        let handle = s.spawn(|| {
            let mut packet = Packet::default();
            let size = bus.driver.receive(0, Some(&mut packet), 500_000);
            (size, packet)
        });

        thread::sleep(Duration::from_millis(5));
        bus.inject_frame(&[0x00, 1, 2, 3, 4, 5, 6, 7]);
        bus.inject_break();

        handle.join().unwrap()
    });

    assert_eq!(size, 8);
    assert_eq!(packet.sc, Some(0x00));
    assert_eq!(packet.err, None);
    assert_eq!(packet.size, 8);
    assert!(!packet.is_rdm);

    let mut data = [0u8; 8];
    assert_eq!(bus.driver.read(0, &mut data), 8);
    assert_eq!(data, [0x00, 1, 2, 3, 4, 5, 6, 7]);
}

#[test]
fn subsequent_frames_complete_on_learned_size() {
    let bus = install_driver(&config());

    // The first short frame teaches the driver the stream's size; the
    // second completes without waiting for another break.
    bus.inject_frame(&[0x00, 10, 20, 30]);
    bus.inject_break();
    let mut packet = Packet::default();
    assert_eq!(bus.driver.receive(0, Some(&mut packet), 0), 4);

    bus.inject_frame(&[0x00, 11, 21, 31]);
    assert_eq!(bus.driver.receive(0, Some(&mut packet), 0), 4);
    assert_eq!(packet.err, None);

    let mut data = [0u8; 4];
    bus.driver.read(0, &mut data);
    assert_eq!(data, [0x00, 11, 21, 31]);
}

#[test]
fn receive_with_zero_wait_returns_immediately() {
    let bus = install_driver(&config());

    let mut packet = Packet::default();
    let started = Instant::now();
    assert_eq!(bus.driver.receive(0, Some(&mut packet), 0), 0);
    assert!(started.elapsed() < Duration::from_millis(50));
    assert_eq!(packet.size, 0);
    assert_eq!(packet.err, Some(DmxError::Timeout));
}

#[test]
fn framing_error_is_stamped_on_the_packet() {
    let bus = install_driver(&config());

    let (size, packet) = thread::scope(|s| {
        let handle = s.spawn(|| {
            let mut packet = Packet::default();
            let size = bus.driver.receive(0, Some(&mut packet), 500_000);
            (size, packet)
        });

        thread::sleep(Duration::from_millis(5));
        bus.inject_break();
        bus.uart.push_rx(&[0x00, 1, 2]);
        bus.uart.raise(dmx_rdm_uart::hal::intr::RX_DATA);
        bus.uart.raise(dmx_rdm_uart::hal::intr::RX_FRAMING_ERR);
        bus.driver.on_uart_interrupt(0);

        handle.join().unwrap()
    });

    assert_eq!(size, 3);
    assert_eq!(packet.err, Some(DmxError::ImproperSlot));
}

#[test]
fn slot_io_round_trips_and_clamps() {
    let bus = install_driver(&config());

    let source = [7u8, 8, 9];
    assert_eq!(bus.driver.write_offset(0, 100, &source), 3);
    let mut data = [0u8; 3];
    assert_eq!(bus.driver.read_offset(0, 100, &mut data), 3);
    assert_eq!(data, source);

    // Writes past the end of the packet are clamped or refused.
    assert_eq!(bus.driver.write_offset(0, 513, &source), 0);
    assert_eq!(bus.driver.write_offset(0, 512, &source), 1);

    assert_eq!(bus.driver.write_slot(0, 5, 0xAB), 0xAB);
    assert_eq!(bus.driver.read_slot(0, 5), 0xAB);
    assert_eq!(bus.driver.read_slot(0, 513), -1);
}

#[test]
fn writes_are_refused_while_sending_rdm() {
    let bus = install_driver(&config());

    let request = disc_unique_branch_request();
    assert_eq!(bus.driver.write(0, &request), request.len());
    assert_eq!(bus.driver.send(0, request.len()), request.len());

    // Mid-transmission the frame must not change under the ISR.
    assert_eq!(bus.driver.write(0, &[0x00, 1, 2]), 0);

    bus.finish_transmission();
}

#[test]
fn discovery_request_enforces_packet_spacing() {
    let bus = install_driver(&config());

    let request = disc_unique_branch_request();
    assert_eq!(bus.driver.write(0, &request), request.len());
    assert_eq!(bus.driver.send(0, request.len()), request.len());
    bus.finish_transmission();

    // After a discovery request the driver listens for responses.
    assert!(bus.uart.rts_listen());

    let done = AtomicBool::new(false);
    thread::scope(|s| {
        let handle = s.spawn(|| {
            let size = bus.driver.send(0, 0);
            done.store(true, Ordering::SeqCst);
            size
        });

        // The send must park on the discovery no-response spacing alarm.
        let arming = Instant::now();
        while !bus.timer.is_running() {
            assert!(arming.elapsed() < Duration::from_secs(1));
            thread::yield_now();
        }
        assert_eq!(
            bus.timer.alarm(),
            RDM_DISCOVERY_NO_RESPONSE_PACKET_SPACING_US as u64
        );
        thread::sleep(Duration::from_millis(2));
        assert!(!done.load(Ordering::SeqCst));

        // Alarm expiry releases the sender.
        bus.driver.on_timer_interrupt(0);
        bus.service_until(|| done.load(Ordering::SeqCst));
        assert_eq!(handle.join().unwrap(), request.len());
    });

    bus.finish_transmission();
}

#[test]
fn discovery_response_window_times_out_early() {
    let bus = install_driver(&config());

    let request = disc_unique_branch_request();
    bus.driver.write(0, &request);
    bus.driver.send(0, request.len());
    bus.finish_transmission();

    let (size, packet) = thread::scope(|s| {
        let handle = s.spawn(|| {
            let mut packet = Packet::default();
            // Ten milliseconds of patience, but the RDM controller window
            // must cut the wait short.
            let size = bus.driver.receive(0, Some(&mut packet), 10_000);
            (size, packet)
        });

        let arming = Instant::now();
        while !bus.timer.is_running() {
            assert!(arming.elapsed() < Duration::from_secs(1));
            thread::yield_now();
        }
        assert_eq!(
            bus.timer.alarm(),
            RDM_CONTROLLER_RESPONSE_LOST_TIMEOUT_US as u64
        );

        bus.driver.on_timer_interrupt(0);
        handle.join().unwrap()
    });

    assert_eq!(size, 0);
    assert_eq!(packet.size, 0);
    assert_eq!(packet.err, Some(DmxError::Timeout));
}

#[test]
fn sniffer_measures_break_and_mab() {
    let bus = install_driver(&config());
    bus.driver.sniffer_enable(0).unwrap();

    // Line drops: the break begins.
    bus.uart.set_rx_level(false);
    bus.driver.on_sniffer_edge(0);
    thread::sleep(Duration::from_millis(2));

    // The UART recognizes the break condition.
    bus.inject_break();

    // Line rises: break over, mark-after-break begins.
    bus.uart.set_rx_level(true);
    bus.driver.on_sniffer_edge(0);
    thread::sleep(Duration::from_millis(1));

    // The first start bit of the start code ends the mark-after-break.
    bus.uart.set_rx_level(false);
    bus.driver.on_sniffer_edge(0);

    let mut metadata = DmxMetadata {
        break_us: 0,
        mab_us: 0,
    };
    assert!(bus.driver.sniffer_get_data(0, &mut metadata, 10_000));
    assert!(metadata.break_us >= 2_000);
    assert!(metadata.mab_us >= 1_000);

    // The mailbox holds a single measurement, newest wins.
    assert!(!bus.driver.sniffer_get_data(0, &mut metadata, 0));
}

#[test]
fn break_and_mab_lengths_are_clamped() {
    let bus = install_driver(&config());

    assert_eq!(bus.driver.set_break_len(0, 50), 92);
    assert_eq!(bus.driver.set_break_len(0, 10_000), 176);
    assert_eq!(bus.driver.set_break_len(0, 100), 100);
    assert_eq!(bus.driver.break_len(0), 100);

    assert_eq!(bus.driver.set_mab_len(0, 5), 12);
    assert_eq!(bus.driver.set_mab_len(0, 1_000), 88);
    assert_eq!(bus.driver.set_mab_len(0, 20), 20);
    assert_eq!(bus.driver.mab_len(0), 20);
}
