//! Edge-timed measurement of received break and mark-after-break lengths.
//!
//! The sniffer needs a GPIO interrupt on both edges of a pin wired to RX;
//! the integrating firmware forwards each edge to
//! [`on_sniffer_edge`](DmxDriver::on_sniffer_edge). Measurements are
//! published into a single-slot mailbox, newest wins.

use crate::driver::{Deadline, DmxDriver};
use crate::hal::{BusTimer, Platform, Uart};
use crate::types::{DmxError, DmxMetadata};

impl<P: Platform, U: Uart, T: BusTimer, const PORTS: usize> DmxDriver<P, U, T, PORTS> {
    pub fn sniffer_enable(&self, port: usize) -> Result<(), DmxError> {
        if !self.check_installed(port) {
            return Err(DmxError::NotInstalled);
        }

        let p = self.port(port);
        critical_section::with(|cs| {
            let mut core = p.core.borrow_ref_mut(cs);
            core.sniffer_enabled = true;
            core.sniffer_in_break = false;
            core.sniffer_break_len = -1;
            core.sniffer_mab_len = -1;
            core.last_pos_edge_ts = -1;
            core.last_neg_edge_ts = -1;
            *p.sniffer_slot.borrow_ref_mut(cs) = None;
        });

        Ok(())
    }

    pub fn sniffer_disable(&self, port: usize) -> Result<(), DmxError> {
        if !self.check_installed(port) {
            return Err(DmxError::NotInstalled);
        }

        let p = self.port(port);
        critical_section::with(|cs| {
            p.core.borrow_ref_mut(cs).sniffer_enabled = false;
            *p.sniffer_slot.borrow_ref_mut(cs) = None;
        });

        Ok(())
    }

    pub fn is_sniffer_enabled(&self, port: usize) -> bool {
        port < PORTS
            && critical_section::with(|cs| self.port(port).core.borrow_ref(cs).sniffer_enabled)
    }

    /// Takes the most recent break/mark-after-break measurement, waiting up
    /// to `wait_us` for one to arrive.
    pub fn sniffer_get_data(&self, port: usize, metadata: &mut DmxMetadata, wait_us: u32) -> bool {
        if !self.check_installed(port) || !self.is_sniffer_enabled(port) {
            return false;
        }

        let p = self.port(port);
        let deadline = Deadline::new::<P>(wait_us);

        loop {
            let taken = critical_section::with(|cs| p.sniffer_slot.borrow_ref_mut(cs).take());
            if let Some(measurement) = taken {
                *metadata = measurement;
                return true;
            }
            if deadline.expired::<P>() {
                return false;
            }
            P::yield_now();
        }
    }

    /// Services an edge interrupt on the sniffer pin. Timestamps the edge
    /// and derives break and mark-after-break lengths from consecutive
    /// transitions.
    pub fn on_sniffer_edge(&self, port: usize) {
        if port >= PORTS {
            return;
        }

        let now = P::micros();
        let p = self.port(port);

        critical_section::with(|cs| {
            let mut core = p.core.borrow_ref_mut(cs);
            if !core.sniffer_enabled {
                return;
            }

            if p.uart.rx_level() {
                // Rising edge: a break that was in progress just ended.
                if core.sniffer_in_break && core.last_neg_edge_ts > -1 {
                    core.sniffer_break_len = now - core.last_neg_edge_ts;
                    core.sniffer_in_break = false;
                }
                core.last_pos_edge_ts = now;
            } else {
                // Falling edge: the mark-after-break ends with the first
                // start bit after a measured break.
                if core.sniffer_mab_len == -1 && core.sniffer_break_len != -1 {
                    core.sniffer_mab_len = now - core.last_pos_edge_ts;
                    *p.sniffer_slot.borrow_ref_mut(cs) = Some(DmxMetadata {
                        break_us: core.sniffer_break_len as u32,
                        mab_us: core.sniffer_mab_len as u32,
                    });
                }
                core.last_neg_edge_ts = now;
            }
        });
    }
}
