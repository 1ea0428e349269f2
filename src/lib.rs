//! Embedded driver for DMX512 (ANSI E1.11) and RDM (ANSI E1.20) over an
//! RS485 bus, built around a register-level UART peripheral and an auxiliary
//! hardware timer. The driver shapes breaks and mark-after-break periods
//! with the timer, delimits inbound frames with byte-accurate timing,
//! arbitrates bus direction over RTS and enforces the RDM inter-packet
//! spacing and response-window rules. A built-in RDM responder answers
//! discovery and the required parameter messages; further PIDs are added
//! through the parameter store.
//!
//! The crate is no-std and allocation free. Hardware and OS services enter
//! through the [`hal`] traits: implement [`hal::Uart`], [`hal::BusTimer`]
//! and [`hal::Platform`] for your target, then forward the UART and timer
//! interrupts to [`DmxDriver::on_uart_interrupt`] and
//! [`DmxDriver::on_timer_interrupt`].
//!
//! # Usage
//!
//! ```ignore
//! use dmx_rdm_uart::{DmxConfig, DmxDriver, PortHardware};
//! use dmx_rdm_uart::types::Packet;
//! use dmx_rdm_uart::unique_identifier::UniqueIdentifier;
//!
//! static DRIVER: DmxDriver<Rtos, SocUart, SocTimer, 1> = /* constructed at boot */;
//!
//! // Interrupt glue, registered by the firmware:
//! fn uart_isr() { DRIVER.on_uart_interrupt(0); }
//! fn timer_isr() { DRIVER.on_timer_interrupt(0); }
//!
//! DRIVER.install(0, &DmxConfig {
//!     uid: UniqueIdentifier::new(0x7FF0, 0x12345678).unwrap(),
//!     software_version_label: "my fixture v1.0",
//!     ..DmxConfig::default()
//! })?;
//!
//! // Send a DMX frame.
//! DRIVER.write(0, &[0x00, 255, 128, 0]);
//! DRIVER.send(0, 4);
//! DRIVER.wait_sent(0, 100_000);
//!
//! // Poll the bus; RDM requests addressed to us are answered before
//! // `receive` returns.
//! let mut packet = Packet::default();
//! loop {
//!     let size = DRIVER.receive(0, Some(&mut packet), 100_000);
//!     if size > 0 && !packet.is_rdm {
//!         // plain DMX data is now in the slot buffer
//!     }
//! }
//! ```
//!
//! Response handlers run on the caller task inside `receive` while the
//! driver mutex is held. They must not re-enter the driver; the dispatcher
//! emits the response after the handler returns.

#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod fmt;

mod bus;
pub mod consts;
mod driver;
/// Parameter packing descriptors used by the RDM parameter store.
pub mod format;
/// Traits the integrating firmware implements for its hardware and OS.
pub mod hal;
mod layouts;
/// The RDM parameter store: registration, storage and the message queue.
pub mod parameter;
pub mod pids;
/// In-buffer RDM message codec.
pub mod rdm_data;
/// The RDM dispatcher and built-in responder parameters.
pub mod responder;
mod sniffer;
pub mod types;
pub mod unique_identifier;

pub use driver::{DmxConfig, DmxDriver, PortHardware};
