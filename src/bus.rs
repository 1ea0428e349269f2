//! The bus engine: the blocking `send`/`receive`/`wait_sent` entry points and
//! the UART and timer interrupt handlers they cooperate with.
//!
//! Outbound frames are shaped by a three-step reset sequence: `send` inverts
//! the TX line and arms the hardware timer; the first alarm ends the break
//! and re-arms for the mark-after-break; the second alarm pushes the first
//! FIFO chunk and hands the remainder to the UART TX interrupt. Inbound
//! frames are delimited by break interrupts and completed either by byte
//! count or, for RDM, as soon as a checksum-valid message is in the buffer.

use crate::consts::{
    DMX_MAX_PACKET_SIZE, DMX_PACKET_TIMEOUT_US, PREAMBLE_BYTE,
    RDM_CONTROLLER_RESPONSE_LOST_TIMEOUT_US, RDM_BROADCAST_PACKET_SPACING_US,
    RDM_DISCOVERY_NO_RESPONSE_PACKET_SPACING_US, RDM_REQUEST_NO_RESPONSE_PACKET_SPACING_US,
    RDM_RESPOND_TO_REQUEST_PACKET_SPACING_US, RDM_RESPONDER_RESPONSE_LOST_TIMEOUT_US,
    SC_RDM, SC_SUB_MESSAGE, SEPARATOR_BYTE, WAIT_FOREVER,
};
use crate::driver::{flags, rdm_flags, Deadline, DmxDriver};
use crate::fmt;
use crate::hal::{intr, BusTimer, Platform, Uart};
use crate::pids;
use crate::rdm_data;
use crate::types::{DmxError, Packet, RequestCommandClass, ResponseCommandClass};
use crate::unique_identifier::PackageAddress;

impl<P: Platform, U: Uart, T: BusTimer, const PORTS: usize> DmxDriver<P, U, T, PORTS> {
    /// Blocks until any in-flight transmission has been handed to the UART,
    /// or until `wait_us` elapses. With a zero wait the sending flag is
    /// polled instead. Returns true when the driver is idle.
    pub fn wait_sent(&self, port: usize, wait_us: u32) -> bool {
        if !self.check_installed(port) {
            return false;
        }

        let p = self.port(port);
        let deadline = Deadline::new::<P>(wait_us);
        let Some(_guard) = p.lock.acquire(wait_us) else {
            return false;
        };
        if wait_us > 0 && deadline.expired::<P>() {
            return false;
        }

        if wait_us == 0 {
            return critical_section::with(|cs| {
                p.core.borrow_ref(cs).flags & flags::IS_SENDING == 0
            });
        }

        let task_waiting = critical_section::with(|cs| {
            let mut core = p.core.borrow_ref_mut(cs);
            if core.flags & flags::IS_SENDING != 0 {
                core.set_task_waiting(Some(P::current_task()));
                true
            } else {
                false
            }
        });

        if task_waiting {
            let notified = P::wait(deadline.remaining::<P>()).is_some();
            critical_section::with(|cs| p.core.borrow_ref_mut(cs).task_waiting = None);
            if !notified {
                P::clear_notification();
                return false;
            }
        }

        true
    }

    /// Transmits `size` slots from the driver buffer, or the previously
    /// written size when `size` is zero.
    ///
    /// Enforces RDM inter-packet spacing against the previous bus activity
    /// and aborts stale RDM responses whose response window has already
    /// closed. Returns the number of slots queued for transmission, 0 on
    /// failure. The transmission itself finishes asynchronously; use
    /// [`wait_sent`](Self::wait_sent) to block on it.
    pub fn send(&self, port: usize, size: usize) -> usize {
        if !self.check_installed(port) {
            return 0;
        }
        if !self.is_enabled(port) {
            fmt::warn!("driver on port {} is not enabled", port);
            return 0;
        }

        let p = self.port(port);
        let Some(_guard) = p.lock.acquire(WAIT_FOREVER) else {
            return 0;
        };

        if !self.wait_sent(port, DMX_PACKET_TIMEOUT_US) {
            return 0;
        }

        // An RDM response must hit the wire inside the responder window;
        // beyond it the controller has moved on.
        let response_elapsed = critical_section::with(|cs| {
            let core = p.core.borrow_ref(cs);
            let buffer = unsafe { p.buffer() };
            let cc = buffer[20];
            if buffer[0] == SC_RDM
                && buffer[1] == SC_SUB_MESSAGE
                && ResponseCommandClass::try_from(cc).is_ok()
            {
                Some(P::micros() - core.last_slot_ts)
            } else {
                None
            }
        });
        if let Some(elapsed) = response_elapsed {
            if elapsed >= RDM_RESPONDER_RESPONSE_LOST_TIMEOUT_US as i64 {
                return 0;
            }
        }

        // Inter-packet spacing, classified from the previous packet.
        let me = P::current_task();
        let needs_spacing = critical_section::with(|cs| {
            let mut core = p.core.borrow_ref_mut(cs);
            let spacing = if core.flags & flags::SENT_LAST != 0 {
                if core.rdm_type & rdm_flags::IS_DISC_UNIQUE_BRANCH != 0 {
                    RDM_DISCOVERY_NO_RESPONSE_PACKET_SPACING_US
                } else if core.rdm_type & rdm_flags::IS_BROADCAST != 0 {
                    RDM_BROADCAST_PACKET_SPACING_US
                } else if core.rdm_type == (rdm_flags::IS_VALID | rdm_flags::IS_REQUEST) {
                    RDM_REQUEST_NO_RESPONSE_PACKET_SPACING_US
                } else {
                    0
                }
            } else if core.rdm_type & rdm_flags::IS_VALID != 0 {
                RDM_RESPOND_TO_REQUEST_PACKET_SPACING_US
            } else {
                0
            };

            let elapsed = P::micros() - core.last_slot_ts;
            if elapsed < spacing as i64 {
                p.timer.set_counter(elapsed as u64);
                p.timer.set_alarm(spacing as u64, false);
                p.timer.start();
                core.flags |= flags::TIMER_RUNNING;
                core.set_task_waiting(Some(me.clone()));
                true
            } else {
                false
            }
        });

        if needs_spacing {
            let notified = P::wait(DMX_PACKET_TIMEOUT_US).is_some();
            critical_section::with(|cs| {
                let mut core = p.core.borrow_ref_mut(cs);
                if !notified {
                    p.timer.stop();
                    core.flags &= !flags::TIMER_RUNNING;
                }
                core.task_waiting = None;
            });
            if !notified {
                P::clear_notification();
                return 0;
            }
        }

        // Turn the bus around.
        critical_section::with(|_cs| {
            if p.uart.get_rts() {
                P::clear_notification();
                p.uart.set_rts(false);
            }
        });

        let size = critical_section::with(|cs| {
            let mut core = p.core.borrow_ref_mut(cs);
            if size > 0 {
                core.tx_size = size.min(DMX_MAX_PACKET_SIZE);
            }
            core.tx_size
        });

        // Classify the outgoing packet. The buffer is stable here: the
        // driver is idle, RTS drives the bus and the port mutex is held.
        let rdm_type = {
            let buffer = unsafe { p.buffer() };
            let mut rdm_type = 0u8;
            if buffer[0] == SC_RDM && buffer[1] == SC_SUB_MESSAGE {
                rdm_type |= rdm_flags::IS_VALID;
                if RequestCommandClass::try_from(buffer[20]).is_ok() {
                    rdm_type |= rdm_flags::IS_REQUEST;
                }
                let dest: &[u8; 6] = buffer[3..9].try_into().unwrap();
                if PackageAddress::from_bytes(dest).is_broadcast() {
                    rdm_type |= rdm_flags::IS_BROADCAST;
                }
                if u16::from_be_bytes(buffer[21..23].try_into().unwrap())
                    == pids::DISC_UNIQUE_BRANCH
                {
                    rdm_type |= rdm_flags::IS_DISC_UNIQUE_BRANCH;
                }
            } else if buffer[0] == PREAMBLE_BYTE || buffer[0] == SEPARATOR_BYTE {
                rdm_type |= rdm_flags::IS_VALID | rdm_flags::IS_DISC_UNIQUE_BRANCH;
            }
            rdm_type
        };

        critical_section::with(|cs| {
            let mut core = p.core.borrow_ref_mut(cs);
            core.rdm_type = rdm_type;
            core.flags |= flags::SENT_LAST;
            if rdm_type & (rdm_flags::IS_VALID | rdm_flags::IS_REQUEST)
                == (rdm_flags::IS_VALID | rdm_flags::IS_REQUEST)
            {
                core.tn = core.tn.wrapping_add(1);
            }
        });

        if rdm_type == (rdm_flags::IS_VALID | rdm_flags::IS_DISC_UNIQUE_BRANCH) {
            // Discovery responses are sent without a break: straight to the
            // FIFO, the UART interrupts drain the rest.
            critical_section::with(|cs| {
                let mut core = p.core.borrow_ref_mut(cs);
                core.flags |= flags::IS_SENDING;

                let buffer = unsafe { p.buffer() };
                let written = p.uart.write_txfifo(&buffer[..core.tx_size]);
                core.head = written as i32;

                p.uart.enable_interrupts(intr::TX_ALL);
            });
        } else {
            // Start the reset sequence: break first, the timer interrupt
            // advances through mark-after-break and data.
            critical_section::with(|cs| {
                let mut core = p.core.borrow_ref_mut(cs);
                core.head = 0;
                core.flags |= flags::IS_IN_BREAK | flags::IS_SENDING | flags::TIMER_RUNNING;
                p.timer.set_counter(0);
                p.timer.set_alarm(core.break_len as u64, true);
                p.timer.start();

                p.uart.invert_tx(true);
            });
        }

        size
    }

    /// Waits for an inbound packet and reports it through `packet`.
    ///
    /// Flips the bus to listen if the port was driving it. When the last
    /// sent packet was a DISC_UNIQUE_BRANCH request, an expired response
    /// window ends the wait early per the RDM controller timing rules.
    /// Valid RDM requests addressed to this device are answered before this
    /// function returns. Returns the received size in slots, 0 when nothing
    /// arrived.
    pub fn receive(&self, port: usize, packet: Option<&mut Packet>, wait_us: u32) -> usize {
        if !self.check_installed(port) {
            return 0;
        }
        if !self.is_enabled(port) {
            fmt::warn!("driver on port {} is not enabled", port);
            return 0;
        }

        let (size, result) = self.receive_inner(port, wait_us);
        if let Some(out) = packet {
            *out = result;
        }

        size
    }

    fn receive_inner(&self, port: usize, wait_us: u32) -> (usize, Packet) {
        let p = self.port(port);
        let mut packet = Packet {
            sc: None,
            err: Some(DmxError::Timeout),
            size: 0,
            is_rdm: false,
        };

        let deadline = Deadline::new::<P>(wait_us);
        let Some(_guard) = p.lock.acquire(wait_us) else {
            return (0, packet);
        };
        if wait_us > 0 && deadline.expired::<P>() {
            return (0, packet);
        }
        if !self.wait_sent(port, deadline.remaining::<P>())
            || (wait_us > 0 && deadline.expired::<P>())
        {
            return (0, packet);
        }

        // Turn the bus to listen if we were driving it.
        critical_section::with(|cs| {
            let mut core = p.core.borrow_ref_mut(cs);
            if !p.uart.get_rts() {
                P::clear_notification();
                core.head = -1; // wait for a break before reading data
                core.flags &= !flags::HAS_DATA;
                p.uart.set_rts(true);
            }
        });

        let driver_flags = critical_section::with(|cs| p.core.borrow_ref(cs).flags);
        let mut err_code = 0u32;

        if driver_flags & flags::HAS_DATA == 0 && deadline.remaining::<P>() > 0 {
            let me = P::current_task();
            let rdm_type = critical_section::with(|cs| {
                let mut core = p.core.borrow_ref_mut(cs);
                core.set_task_waiting(Some(me.clone()));
                core.rdm_type
            });

            // A DISC_UNIQUE_BRANCH request we sent bounds the wait by the
            // controller's response-lost window.
            const EARLY_TIMEOUT: u8 = rdm_flags::IS_REQUEST | rdm_flags::IS_DISC_UNIQUE_BRANCH;
            if driver_flags & flags::SENT_LAST != 0 && rdm_type & EARLY_TIMEOUT == EARLY_TIMEOUT {
                let last_slot_ts =
                    critical_section::with(|cs| p.core.borrow_ref(cs).last_slot_ts);
                let elapsed = P::micros() - last_slot_ts;

                if elapsed >= RDM_CONTROLLER_RESPONSE_LOST_TIMEOUT_US as i64 {
                    critical_section::with(|cs| {
                        p.core.borrow_ref_mut(cs).task_waiting = None;
                    });
                    return (0, packet);
                }

                critical_section::with(|cs| {
                    let mut core = p.core.borrow_ref_mut(cs);
                    p.timer.set_counter(elapsed as u64);
                    p.timer
                        .set_alarm(RDM_CONTROLLER_RESPONSE_LOST_TIMEOUT_US as u64, false);
                    p.timer.start();
                    core.flags |= flags::TIMER_RUNNING;
                });
            }

            let notified = P::wait(deadline.remaining::<P>());
            critical_section::with(|cs| {
                let mut core = p.core.borrow_ref_mut(cs);
                p.timer.stop();
                core.flags &= !flags::TIMER_RUNNING;
                core.task_waiting = None;
            });
            match notified {
                Some(value) => err_code = value,
                None => {
                    P::clear_notification();
                    return (0, packet);
                },
            }
        } else if driver_flags & flags::HAS_DATA == 0 {
            // No data and the caller cannot block.
            return (0, packet);
        }

        let (size, sc) = critical_section::with(|cs| {
            let mut core = p.core.borrow_ref_mut(cs);
            let has_data = core.flags & flags::HAS_DATA != 0;
            core.flags &= !flags::HAS_DATA;
            let size = if has_data { core.rx_completed_size } else { 0 };
            let sc = (size > 0).then(|| unsafe { p.buffer() }[0]);
            (size, sc)
        });

        packet.sc = sc;
        packet.err = DmxError::from_code(err_code);
        packet.size = size;

        if size == 0 {
            return (0, packet);
        }

        // RDM requests are answered synchronously on this task.
        packet.is_rdm = self.rdm_dispatch(port, size);

        (size, packet)
    }

    /// Services a UART interrupt for `port`. Call from the interrupt handler
    /// the integrating firmware registered for the UART peripheral; must be
    /// resident (IRAM or equivalent) on platforms that page program memory.
    pub fn on_uart_interrupt(&self, port: usize) {
        if port >= PORTS {
            return;
        }

        let now = P::micros();
        let p = self.port(port);

        loop {
            let intr_flags = p.uart.interrupt_status();
            if intr_flags == 0 {
                break;
            }

            if intr_flags & intr::RX_ALL != 0 {
                // Receive activity supersedes any pending alarm.
                critical_section::with(|cs| {
                    let mut core = p.core.borrow_ref_mut(cs);
                    if core.flags & flags::TIMER_RUNNING != 0 {
                        p.timer.stop();
                        core.flags &= !flags::TIMER_RUNNING;
                    }
                });

                let is_break = intr_flags & intr::RX_BREAK != 0;
                let mut oversize = false;

                critical_section::with(|cs| {
                    let mut core = p.core.borrow_ref_mut(cs);
                    if core.head >= 0 && (core.head as usize) < DMX_MAX_PACKET_SIZE {
                        let head = core.head as usize;
                        let buffer = unsafe { p.buffer() };
                        let read = p.uart.read_rxfifo(&mut buffer[head..]);
                        core.head += read as i32;
                        if core.head as usize > core.rx_size {
                            core.rx_size = core.head as usize;
                        }
                        if core.head as usize == DMX_MAX_PACKET_SIZE && p.uart.rxfifo_len() > 0 {
                            // Truncated: the packet exceeds the buffer.
                            oversize = core.flags & flags::IS_IDLE == 0;
                            p.uart.rxfifo_reset();
                        }
                    } else {
                        if core.head > 0 {
                            // Track the size of an overlong packet.
                            core.head += p.uart.rxfifo_len() as i32;
                        }
                        p.uart.rxfifo_reset();
                    }
                });

                if is_break {
                    critical_section::with(|cs| {
                        let mut core = p.core.borrow_ref_mut(cs);
                        if core.flags & flags::IS_IDLE == 0 && core.head > 0 {
                            // The break ends a frame that never reached the
                            // expected size: deliver it now, newest wins, and
                            // complete on the observed count next time.
                            let head = (core.head as usize).min(DMX_MAX_PACKET_SIZE);
                            let err_code = if core.head as usize > DMX_MAX_PACKET_SIZE {
                                DmxError::PacketSize.code()
                            } else {
                                core.rx_size = head;
                                0
                            };
                            core.rx_completed_size = head;
                            core.flags |= flags::HAS_DATA;
                            core.flags &= !flags::SENT_LAST;
                            core.rdm_type = 0;
                            if let Some(task) = core.task_waiting.clone() {
                                P::notify(&task, err_code);
                            }
                        }
                        core.flags &= !flags::IS_IDLE;
                        core.head = 0;
                        // Frame boundary for the sniffer measurements.
                        core.sniffer_in_break = true;
                        core.sniffer_break_len = -1;
                        core.sniffer_mab_len = -1;
                    });
                }

                critical_section::with(|cs| {
                    let mut core = p.core.borrow_ref_mut(cs);
                    core.last_slot_ts = now;
                    if is_break {
                        core.flags |= flags::IS_IN_BREAK;
                    } else {
                        core.flags &= !flags::IS_IN_BREAK;
                    }
                });
                p.uart.clear_interrupts(intr_flags & intr::RX_ALL);

                if intr_flags & intr::RX_CLASH != 0 {
                    // Multiple responders drove the bus at once, typical of
                    // discovery. The frame is lost; the controller retries.
                    fmt::debug!("bus collision on port {}", port);
                }

                let dmx_flags = critical_section::with(|cs| p.core.borrow_ref(cs).flags);
                if dmx_flags & flags::IS_IDLE != 0 && !oversize {
                    continue;
                }

                // Check for an end-of-packet condition.
                let mut rdm_type = 0u8;
                let mut err_code = 0u32;
                let mut is_complete = false;

                if oversize {
                    err_code = DmxError::PacketSize.code();
                    is_complete = true;
                } else if intr_flags & intr::RX_ERR != 0 {
                    err_code = if intr_flags & intr::RX_FIFO_OVERFLOW != 0 {
                        DmxError::DataOverflow.code()
                    } else {
                        DmxError::ImproperSlot.code()
                    };
                    p.uart.rxfifo_reset();
                    is_complete = true;
                } else {
                    let (head, rx_size) = critical_section::with(|cs| {
                        let core = p.core.borrow_ref(cs);
                        let head = (core.head.max(0) as usize).min(DMX_MAX_PACKET_SIZE);
                        (head, core.rx_size)
                    });

                    if head > 16 {
                        let buffer = unsafe { p.buffer() };
                        if let Some((header, total)) = rdm_data::read_header(&buffer[..head]) {
                            if total == head {
                                rdm_type |= rdm_flags::IS_VALID;
                                if header.is_request() {
                                    rdm_type |= rdm_flags::IS_REQUEST;
                                }
                                if header.dest_uid.is_broadcast() {
                                    rdm_type |= rdm_flags::IS_BROADCAST;
                                }
                                if header.pid == pids::DISC_UNIQUE_BRANCH {
                                    rdm_type |= rdm_flags::IS_DISC_UNIQUE_BRANCH;
                                }
                                is_complete = true;
                            }
                        }
                    }
                    if !is_complete && head >= rx_size {
                        is_complete = true;
                    }
                }

                if is_complete {
                    critical_section::with(|cs| {
                        let mut core = p.core.borrow_ref_mut(cs);
                        if core.head > DMX_MAX_PACKET_SIZE as i32 {
                            core.head = DMX_MAX_PACKET_SIZE as i32;
                        }
                        core.rx_completed_size = core.head.max(0) as usize;
                        core.flags |= flags::HAS_DATA | flags::IS_IDLE;
                        core.flags &= !flags::SENT_LAST;
                        core.rdm_type = rdm_type;
                        if let Some(task) = core.task_waiting.clone() {
                            P::notify(&task, err_code);
                        }
                    });
                }
            } else if intr_flags & intr::TX_DATA != 0 {
                // The UART is ready for more data.
                critical_section::with(|cs| {
                    let mut core = p.core.borrow_ref_mut(cs);
                    let head = core.head.max(0) as usize;
                    let buffer = unsafe { p.buffer() };
                    let written = p.uart.write_txfifo(&buffer[head..core.tx_size]);
                    core.head += written as i32;

                    if core.head as usize == core.tx_size {
                        p.uart.disable_interrupts(intr::TX_DATA);
                    }
                });
                p.uart.clear_interrupts(intr::TX_DATA);
            } else if intr_flags & intr::TX_DONE != 0 {
                // All data has been accepted by the UART; the buffer is
                // reusable from here on.
                p.uart.disable_interrupts(intr::TX_ALL);
                p.uart.clear_interrupts(intr::TX_DONE);

                critical_section::with(|cs| {
                    let mut core = p.core.borrow_ref_mut(cs);
                    core.flags &= !flags::IS_SENDING;
                    core.last_slot_ts = now;
                    if let Some(task) = core.task_waiting.clone() {
                        P::notify(&task, 0);
                    }

                    // Turn the bus around right away when a response is due.
                    let expecting_response =
                        if core.rdm_type & rdm_flags::IS_DISC_UNIQUE_BRANCH != 0 {
                            core.head = 0; // discovery responses carry no break
                            true
                        } else if core.rdm_type & rdm_flags::IS_REQUEST != 0 {
                            core.head = -1;
                            true
                        } else {
                            false
                        };
                    if expecting_response {
                        core.flags &= !(flags::IS_IDLE | flags::HAS_DATA);
                        p.uart.rxfifo_reset();
                        p.uart.set_rts(true);
                    }
                });
            } else {
                // Unexpected cause; silence it rather than spin.
                p.uart.disable_interrupts(intr_flags);
                p.uart.clear_interrupts(intr_flags);
            }
        }
    }

    /// Services the hardware timer alarm for `port`. Drives the break and
    /// mark-after-break steps of an outgoing frame, or expires a spacing or
    /// response-lost wait.
    pub fn on_timer_interrupt(&self, port: usize) {
        if port >= PORTS {
            return;
        }

        let p = self.port(port);
        critical_section::with(|cs| {
            let mut core = p.core.borrow_ref_mut(cs);

            if core.flags & flags::IS_SENDING != 0 {
                if core.flags & flags::IS_IN_BREAK != 0 {
                    // End of break: idle the line for the mark-after-break.
                    p.uart.invert_tx(false);
                    core.flags &= !flags::IS_IN_BREAK;
                    p.timer.set_alarm(core.mab_len as u64, false);
                } else {
                    // End of mark-after-break: hand the data to the UART.
                    let head = core.head.max(0) as usize;
                    let buffer = unsafe { p.buffer() };
                    let written = p.uart.write_txfifo(&buffer[head..core.tx_size]);
                    core.head += written as i32;

                    p.timer.stop();
                    p.timer.set_counter(0);
                    core.flags &= !flags::TIMER_RUNNING;

                    p.uart.enable_interrupts(intr::TX_ALL);
                }
            } else if let Some(task) = core.task_waiting.clone() {
                // A spacing or response-lost alarm expired.
                P::notify(&task, DmxError::Timeout.code());
                p.timer.stop();
                p.timer.set_counter(0);
                core.flags &= !flags::TIMER_RUNNING;
            }
        });
    }
}
