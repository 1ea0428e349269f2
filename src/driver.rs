//! Driver state and the task-level port API: lifecycle, configuration and
//! asynchronous slot I/O.

use core::cell::{RefCell, UnsafeCell};

use critical_section::Mutex;

use crate::consts::{
    DMX_BAUD_RATE, DMX_BAUD_RATE_MAX, DMX_BAUD_RATE_MIN, DMX_BREAK_LEN_DEFAULT_US,
    DMX_BREAK_LEN_MAX_US, DMX_BREAK_LEN_MIN_US, DMX_MAB_LEN_DEFAULT_US, DMX_MAB_LEN_MAX_US,
    DMX_MAB_LEN_MIN_US, DMX_MAX_PACKET_SIZE, WAIT_FOREVER,
};
use crate::fmt;
use crate::hal::{intr, BusTimer, Platform, Uart};
use crate::parameter::ParameterTable;
use crate::types::{DmxError, DmxMetadata};
use crate::unique_identifier::UniqueIdentifier;

/// Driver state flags. Shared between task and interrupt context, only ever
/// touched under the critical section.
pub(crate) mod flags {
    pub const IS_ENABLED: u8 = 1 << 0;
    /// No packet is currently being accumulated or processed.
    pub const IS_IDLE: u8 = 1 << 1;
    pub const IS_SENDING: u8 = 1 << 2;
    /// The last bus activity was our own transmission.
    pub const SENT_LAST: u8 = 1 << 3;
    pub const IS_IN_BREAK: u8 = 1 << 4;
    pub const IS_INSTALLED: u8 = 1 << 5;
    /// A received packet awaits collection by `receive`.
    pub const HAS_DATA: u8 = 1 << 6;
    pub const TIMER_RUNNING: u8 = 1 << 7;
}

/// Classification of the most recent packet on the bus.
pub(crate) mod rdm_flags {
    pub const IS_VALID: u8 = 1 << 0;
    pub const IS_REQUEST: u8 = 1 << 1;
    pub const IS_BROADCAST: u8 = 1 << 2;
    pub const IS_DISC_UNIQUE_BRANCH: u8 = 1 << 4;
}

/// Static configuration applied at [`DmxDriver::install`].
#[derive(Clone)]
pub struct DmxConfig {
    /// This responder's unique id.
    pub uid: UniqueIdentifier,
    pub break_len_us: u32,
    pub mab_len_us: u32,
    pub model_id: u16,
    pub product_category: u16,
    pub software_version_id: u32,
    /// At most 32 bytes end up on the wire.
    pub software_version_label: &'static str,
    pub dmx_start_address: u16,
    pub dmx_footprint: u16,
    pub current_personality: u8,
    pub personality_count: u8,
}

impl Default for DmxConfig {
    fn default() -> Self {
        Self {
            uid: UniqueIdentifier::new(0x7FF0, 0).unwrap(), // prototyping id
            break_len_us: DMX_BREAK_LEN_DEFAULT_US,
            mab_len_us: DMX_MAB_LEN_DEFAULT_US,
            model_id: 0,
            product_category: 0,
            software_version_id: 0,
            software_version_label: "dmx-rdm-uart device",
            dmx_start_address: 1,
            dmx_footprint: 1,
            current_personality: 1,
            personality_count: 1,
        }
    }
}

/// Per-port state shared between caller tasks and the interrupt handlers.
pub(crate) struct PortCore<P: Platform> {
    /// TX: slots pushed to the FIFO. RX: slots received since the last
    /// break; -1 while awaiting a break.
    pub head: i32,
    pub tx_size: usize,
    /// Expected size of the incoming packet, learned from traffic.
    pub rx_size: usize,
    /// Size of the packet most recently delivered through HAS_DATA.
    pub rx_completed_size: usize,
    pub flags: u8,
    pub rdm_type: u8,
    pub tn: u8,
    /// Timestamp of the last observed slot boundary, µs since boot.
    pub last_slot_ts: i64,
    pub break_len: u32,
    pub mab_len: u32,
    pub task_waiting: Option<P::TaskId>,
    // Sniffer edge-timing state. -1 marks "not seen this frame".
    pub sniffer_enabled: bool,
    pub sniffer_in_break: bool,
    pub sniffer_break_len: i64,
    pub sniffer_mab_len: i64,
    pub last_pos_edge_ts: i64,
    pub last_neg_edge_ts: i64,
}

impl<P: Platform> PortCore<P> {
    fn new() -> Self {
        Self {
            head: -1,
            tx_size: DMX_MAX_PACKET_SIZE,
            rx_size: DMX_MAX_PACKET_SIZE,
            rx_completed_size: 0,
            flags: 0,
            rdm_type: 0,
            tn: 0,
            last_slot_ts: 0,
            break_len: DMX_BREAK_LEN_DEFAULT_US,
            mab_len: DMX_MAB_LEN_DEFAULT_US,
            task_waiting: None,
            sniffer_enabled: false,
            sniffer_in_break: false,
            sniffer_break_len: -1,
            sniffer_mab_len: -1,
            last_pos_edge_ts: -1,
            last_neg_edge_ts: -1,
        }
    }

    /// Only one task may wait on a port at a time; a second waiter would
    /// silently steal the notification.
    pub fn set_task_waiting(&mut self, task: Option<P::TaskId>) {
        debug_assert!(
            task.is_none() || self.task_waiting.is_none() || self.task_waiting == task,
            "a task is already waiting on this port"
        );
        self.task_waiting = task;
    }
}

struct LockState<T> {
    owner: Option<T>,
    depth: u32,
}

/// Recursive caller mutex serializing `send`, `receive` and `wait_sent` per
/// port. Contention is resolved by yielding, never by the notification slot,
/// which belongs to the bus engine.
pub(crate) struct PortLock<P: Platform> {
    state: Mutex<RefCell<LockState<P::TaskId>>>,
}

impl<P: Platform> PortLock<P> {
    fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(LockState {
                owner: None,
                depth: 0,
            })),
        }
    }

    pub fn acquire(&self, wait_us: u32) -> Option<PortGuard<'_, P>> {
        let me = P::current_task();
        let deadline = Deadline::new::<P>(wait_us);

        loop {
            let acquired = critical_section::with(|cs| {
                let mut state = self.state.borrow_ref_mut(cs);
                match &state.owner {
                    None => {
                        state.owner = Some(me.clone());
                        state.depth = 1;
                        true
                    },
                    Some(owner) if *owner == me => {
                        state.depth += 1;
                        true
                    },
                    Some(_) => false,
                }
            });

            if acquired {
                return Some(PortGuard { lock: self });
            }
            if deadline.expired::<P>() {
                return None;
            }
            P::yield_now();
        }
    }

    fn release(&self) {
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            state.depth = state.depth.saturating_sub(1);
            if state.depth == 0 {
                state.owner = None;
            }
        });
    }
}

pub(crate) struct PortGuard<'a, P: Platform> {
    lock: &'a PortLock<P>,
}

impl<P: Platform> Drop for PortGuard<'_, P> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Tracks a wait budget across multiple blocking steps.
#[derive(Copy, Clone)]
pub(crate) struct Deadline {
    at: Option<i64>,
}

impl Deadline {
    pub fn new<P: Platform>(wait_us: u32) -> Self {
        Self {
            at: (wait_us != WAIT_FOREVER).then(|| P::micros() + wait_us as i64),
        }
    }

    pub fn remaining<P: Platform>(&self) -> u32 {
        match self.at {
            None => WAIT_FOREVER,
            Some(at) => ((at - P::micros()).max(0) as u64).min((WAIT_FOREVER - 1) as u64) as u32,
        }
    }

    pub fn expired<P: Platform>(&self) -> bool {
        self.at.is_some() && self.remaining::<P>() == 0
    }
}

pub(crate) struct DmxPort<P: Platform, U: Uart, T: BusTimer> {
    pub uart: U,
    pub timer: T,
    /// The slot buffer. Kept outside the critical-section cell so task-side
    /// snapshot reads can run without masking interrupts; byte tearing is
    /// benign for monitoring reads.
    buffer: UnsafeCell<[u8; DMX_MAX_PACKET_SIZE]>,
    pub core: Mutex<RefCell<PortCore<P>>>,
    pub table: Mutex<RefCell<ParameterTable>>,
    pub lock: PortLock<P>,
    /// Single-slot mailbox between the sniffer ISR and its consumer.
    pub sniffer_slot: Mutex<RefCell<Option<DmxMetadata>>>,
}

impl<P: Platform, U: Uart, T: BusTimer> DmxPort<P, U, T> {
    fn new(uart: U, timer: T) -> Self {
        Self {
            uart,
            timer,
            buffer: UnsafeCell::new([0; DMX_MAX_PACKET_SIZE]),
            core: Mutex::new(RefCell::new(PortCore::new())),
            table: Mutex::new(RefCell::new(ParameterTable::new())),
            lock: PortLock::new(),
            sniffer_slot: Mutex::new(RefCell::new(None)),
        }
    }

    pub fn buffer_ptr(&self) -> *mut u8 {
        self.buffer.get() as *mut u8
    }

    /// Exclusive view of the slot buffer.
    ///
    /// # Safety
    ///
    /// The caller must either hold the critical section or otherwise own the
    /// bus direction (ISR paths, or task paths holding the port mutex while
    /// the driver is idle).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn buffer(&self) -> &mut [u8; DMX_MAX_PACKET_SIZE] {
        &mut *self.buffer.get()
    }
}

// The UnsafeCell buffer suppresses auto-Sync. Index state is only mutated
// under the critical section and buffer writes follow the bus-ownership
// protocol; concurrent task reads are documented as tearing-tolerant.
unsafe impl<P: Platform, U: Uart + Sync, T: BusTimer + Sync> Sync for DmxPort<P, U, T> where
    P::TaskId: Send
{
}

/// UART and timer peripherals backing one port.
pub struct PortHardware<U, T> {
    pub uart: U,
    pub timer: T,
}

/// The DMX/RDM bus driver.
///
/// Owns `PORTS` independent port states. Every public operation names its
/// port explicitly; no global state is kept, so several drivers (or ports)
/// can coexist in one process, including under test.
pub struct DmxDriver<P: Platform, U: Uart, T: BusTimer, const PORTS: usize> {
    ports: [DmxPort<P, U, T>; PORTS],
}

impl<P: Platform, U: Uart, T: BusTimer, const PORTS: usize> DmxDriver<P, U, T, PORTS> {
    pub fn new(hardware: [PortHardware<U, T>; PORTS]) -> Self {
        Self {
            ports: hardware.map(|parts| DmxPort::new(parts.uart, parts.timer)),
        }
    }

    pub(crate) fn port(&self, port: usize) -> &DmxPort<P, U, T> {
        &self.ports[port]
    }

    pub(crate) fn check_port(&self, port: usize) -> bool {
        if port >= PORTS {
            fmt::warn!("port {} is out of range", port);
            return false;
        }
        true
    }

    pub(crate) fn flags(&self, port: usize) -> u8 {
        critical_section::with(|cs| self.ports[port].core.borrow_ref(cs).flags)
    }

    pub fn is_installed(&self, port: usize) -> bool {
        port < PORTS && self.flags(port) & flags::IS_INSTALLED != 0
    }

    pub fn is_enabled(&self, port: usize) -> bool {
        port < PORTS
            && self.flags(port) & (flags::IS_INSTALLED | flags::IS_ENABLED)
                == (flags::IS_INSTALLED | flags::IS_ENABLED)
    }

    pub(crate) fn check_installed(&self, port: usize) -> bool {
        if !self.check_port(port) {
            return false;
        }
        if !self.is_installed(port) {
            fmt::warn!("driver on port {} is not installed", port);
            return false;
        }
        true
    }

    /// Initializes a port and starts listening on the bus.
    ///
    /// Registers the built-in RDM responder parameters and restores persisted
    /// values through the platform's storage hooks.
    pub fn install(&self, port: usize, config: &DmxConfig) -> Result<(), DmxError> {
        if port >= PORTS {
            return Err(DmxError::InvalidArg);
        }
        if self.is_installed(port) {
            fmt::warn!("driver on port {} is already installed", port);
            return Err(DmxError::InvalidArg);
        }
        if config.dmx_start_address == 0 || config.dmx_start_address as usize >= DMX_MAX_PACKET_SIZE
        {
            return Err(DmxError::InvalidArg);
        }

        let p = self.port(port);

        p.uart.disable_interrupts(intr::ALL);
        p.uart.clear_interrupts(intr::ALL);
        p.uart.set_baud_rate(DMX_BAUD_RATE);
        p.uart.set_break_bits(0);
        p.uart.set_idle_bits(0);
        p.uart.rxfifo_reset();

        critical_section::with(|cs| {
            let mut core = p.core.borrow_ref_mut(cs);
            *core = PortCore::new();
            core.flags = flags::IS_INSTALLED | flags::IS_ENABLED | flags::IS_IDLE;
            core.break_len = config.break_len_us.clamp(DMX_BREAK_LEN_MIN_US, DMX_BREAK_LEN_MAX_US);
            core.mab_len = config.mab_len_us.clamp(DMX_MAB_LEN_MIN_US, DMX_MAB_LEN_MAX_US);

            let mut table = p.table.borrow_ref_mut(cs);
            table.clear();
            table.uid = config.uid;
            table.software_version_label = config.software_version_label;
        });

        self.register_default_parameters(port, config);

        critical_section::with(|_cs| {
            P::clear_notification();
            p.uart.enable_interrupts(intr::RX_ALL);
            p.uart.set_rts(true);
        });

        Ok(())
    }

    /// Stops the port and releases it for re-installation. Parameter
    /// registrations are dropped.
    pub fn uninstall(&self, port: usize) -> Result<(), DmxError> {
        if port >= PORTS {
            return Err(DmxError::InvalidArg);
        }
        if !self.is_installed(port) {
            return Err(DmxError::NotInstalled);
        }

        let p = self.port(port);
        let _guard = p.lock.acquire(WAIT_FOREVER);

        p.uart.disable_interrupts(intr::ALL);
        p.uart.clear_interrupts(intr::ALL);
        critical_section::with(|cs| {
            p.timer.stop();
            let mut core = p.core.borrow_ref_mut(cs);
            core.flags = 0;
            core.task_waiting = None;
            p.table.borrow_ref_mut(cs).clear();
        });

        Ok(())
    }

    /// Pauses reception, for example around flash operations that would
    /// starve the interrupt handler.
    pub fn disable(&self, port: usize) -> Result<(), DmxError> {
        if !self.check_installed(port) {
            return Err(DmxError::NotInstalled);
        }

        let p = self.port(port);
        critical_section::with(|cs| {
            let mut core = p.core.borrow_ref_mut(cs);
            if core.flags & flags::IS_SENDING != 0 {
                return Err(DmxError::InvalidArg);
            }
            p.uart.disable_interrupts(intr::RX_ALL);
            p.uart.clear_interrupts(intr::RX_ALL);
            core.flags &= !flags::IS_ENABLED;
            Ok(())
        })
    }

    pub fn enable(&self, port: usize) -> Result<(), DmxError> {
        if !self.check_installed(port) {
            return Err(DmxError::NotInstalled);
        }

        let p = self.port(port);
        critical_section::with(|cs| {
            let mut core = p.core.borrow_ref_mut(cs);
            core.head = -1; // wait for a break before reading data
            core.flags |= flags::IS_ENABLED | flags::IS_IDLE;
            core.flags &= !(flags::IS_IN_BREAK | flags::HAS_DATA);
            p.uart.rxfifo_reset();
            p.uart.enable_interrupts(intr::RX_ALL);
            p.uart.clear_interrupts(intr::RX_ALL);
        });

        Ok(())
    }

    /// Sets the baud rate, clamped to the DMX legal range. Returns the value
    /// in effect.
    pub fn set_baud_rate(&self, port: usize, baud_rate: u32) -> u32 {
        if !self.check_installed(port) {
            return 0;
        }

        let baud_rate = baud_rate.clamp(DMX_BAUD_RATE_MIN, DMX_BAUD_RATE_MAX);
        self.port(port).uart.set_baud_rate(baud_rate);

        baud_rate
    }

    pub fn baud_rate(&self, port: usize) -> u32 {
        if !self.check_installed(port) {
            return 0;
        }

        self.port(port).uart.baud_rate()
    }

    /// Sets the transmitted break length in microseconds, clamped to the
    /// legal range. Returns the value in effect.
    pub fn set_break_len(&self, port: usize, break_len_us: u32) -> u32 {
        if !self.check_installed(port) {
            return 0;
        }

        let break_len = break_len_us.clamp(DMX_BREAK_LEN_MIN_US, DMX_BREAK_LEN_MAX_US);
        critical_section::with(|cs| {
            self.port(port).core.borrow_ref_mut(cs).break_len = break_len;
        });

        break_len
    }

    pub fn break_len(&self, port: usize) -> u32 {
        if !self.check_installed(port) {
            return 0;
        }

        critical_section::with(|cs| self.port(port).core.borrow_ref(cs).break_len)
    }

    /// Sets the transmitted mark-after-break length in microseconds, clamped
    /// to the legal range. Returns the value in effect.
    pub fn set_mab_len(&self, port: usize, mab_len_us: u32) -> u32 {
        if !self.check_installed(port) {
            return 0;
        }

        let mab_len = mab_len_us.clamp(DMX_MAB_LEN_MIN_US, DMX_MAB_LEN_MAX_US);
        critical_section::with(|cs| {
            self.port(port).core.borrow_ref_mut(cs).mab_len = mab_len;
        });

        mab_len
    }

    pub fn mab_len(&self, port: usize) -> u32 {
        if !self.check_installed(port) {
            return 0;
        }

        critical_section::with(|cs| self.port(port).core.borrow_ref(cs).mab_len)
    }

    /// Copies slots out of the driver buffer without locking. The snapshot is
    /// eventually consistent with bus traffic, which is sufficient for
    /// monitoring reads.
    pub fn read_offset(&self, port: usize, offset: usize, destination: &mut [u8]) -> usize {
        if !self.check_installed(port) || offset >= DMX_MAX_PACKET_SIZE {
            return 0;
        }

        let size = destination.len().min(DMX_MAX_PACKET_SIZE - offset);
        if size == 0 {
            return 0;
        }

        let src = self.port(port).buffer_ptr();
        // Plain byte copy; tearing against a concurrently received frame is
        // accepted by the read contract.
        unsafe {
            core::ptr::copy_nonoverlapping(src.add(offset), destination.as_mut_ptr(), size);
        }

        size
    }

    pub fn read(&self, port: usize, destination: &mut [u8]) -> usize {
        self.read_offset(port, 0, destination)
    }

    /// Reads a single slot. Returns -1 on precondition failure.
    pub fn read_slot(&self, port: usize, slot: usize) -> i32 {
        if slot >= DMX_MAX_PACKET_SIZE {
            return -1;
        }

        let mut value = [0u8; 1];
        if self.read_offset(port, slot, &mut value) != 1 {
            return -1;
        }

        value[0] as i32
    }

    /// Copies slots into the driver buffer and records the intended transmit
    /// size. Refused while an RDM frame is being transmitted; flips the bus
    /// to drive when the port was listening.
    pub fn write_offset(&self, port: usize, offset: usize, source: &[u8]) -> usize {
        if !self.check_installed(port) || offset >= DMX_MAX_PACKET_SIZE {
            return 0;
        }

        let size = source.len().min(DMX_MAX_PACKET_SIZE - offset);
        if size == 0 {
            return 0;
        }

        let p = self.port(port);
        critical_section::with(|cs| {
            let mut core = p.core.borrow_ref_mut(cs);
            if core.flags & flags::IS_SENDING != 0 && core.rdm_type != 0 {
                // No asynchronous mutation of an in-flight RDM frame.
                return 0;
            }
            if p.uart.get_rts() {
                p.uart.set_rts(false);
            }
            core.tx_size = offset + size;

            let buffer = unsafe { p.buffer() };
            buffer[offset..offset + size].copy_from_slice(&source[..size]);

            size
        })
    }

    pub fn write(&self, port: usize, source: &[u8]) -> usize {
        self.write_offset(port, 0, source)
    }

    /// Writes a single slot. Returns -1 on precondition failure.
    pub fn write_slot(&self, port: usize, slot: usize, value: u8) -> i32 {
        if slot >= DMX_MAX_PACKET_SIZE {
            return -1;
        }

        if self.write_offset(port, slot, &[value]) != 1 {
            return -1;
        }

        value as i32
    }
}
