//! Hardware and operating system seams.
//!
//! The driver never touches registers or scheduler primitives directly; the
//! integrating firmware implements these traits over its UART peripheral,
//! a 1 MHz hardware timer and its RTOS services, then forwards the UART and
//! timer interrupts to [`DmxDriver`](crate::DmxDriver).

/// Driver-level interrupt causes. Implementations map their peripheral's
/// status bits onto these masks.
pub mod intr {
    /// The receive FIFO overflowed.
    pub const RX_FIFO_OVERFLOW: u32 = 1 << 0;
    /// A slot arrived with a framing or parity error.
    pub const RX_FRAMING_ERR: u32 = 1 << 1;
    /// A break was detected on the receive line.
    pub const RX_BREAK: u32 = 1 << 2;
    /// The receive FIFO passed its watermark or timed out with pending data.
    pub const RX_DATA: u32 = 1 << 3;
    /// Another transmitter drove the bus while we were sending.
    pub const RX_CLASH: u32 = 1 << 4;
    /// The transmit FIFO drained below its watermark.
    pub const TX_DATA: u32 = 1 << 5;
    /// The transmitter finished shifting out all accepted data.
    pub const TX_DONE: u32 = 1 << 6;

    pub const RX_ERR: u32 = RX_FIFO_OVERFLOW | RX_FRAMING_ERR;
    pub const RX_ALL: u32 = RX_DATA | RX_BREAK | RX_ERR | RX_CLASH;
    pub const TX_ALL: u32 = TX_DATA | TX_DONE;
    pub const ALL: u32 = RX_ALL | TX_ALL;
}

/// Register-level access to a UART peripheral running 250 kbit/s 8N2.
///
/// Methods take `&self`: implementations are expected to wrap memory-mapped
/// registers or otherwise provide their own interior mutability, and several
/// methods are called from interrupt context.
pub trait Uart {
    /// Pending driver-level interrupt causes, masked by what is enabled.
    fn interrupt_status(&self) -> u32;
    fn enable_interrupts(&self, mask: u32);
    fn disable_interrupts(&self, mask: u32);
    fn clear_interrupts(&self, mask: u32);

    fn rxfifo_len(&self) -> usize;
    /// Drains up to `dst.len()` bytes from the receive FIFO. Returns the
    /// number of bytes read.
    fn read_rxfifo(&self, dst: &mut [u8]) -> usize;
    fn rxfifo_reset(&self);

    fn txfifo_len(&self) -> usize;
    /// Pushes bytes into the transmit FIFO. Returns the number of bytes the
    /// FIFO accepted.
    fn write_txfifo(&self, src: &[u8]) -> usize;

    fn set_baud_rate(&self, baud_rate: u32);
    fn baud_rate(&self) -> u32;

    /// Number of break bits the UART appends on its own. The driver shapes
    /// breaks with the hardware timer and keeps this at zero.
    fn set_break_bits(&self, bits: u8);
    /// Number of idle bits the UART inserts after each frame.
    fn set_idle_bits(&self, bits: u8);

    /// Forces the TX line low (`true`) for generating breaks.
    fn invert_tx(&self, invert: bool);

    /// Transceiver direction: `true` is listening, `false` is driving.
    fn get_rts(&self) -> bool;
    fn set_rts(&self, listen: bool);

    /// Instantaneous level of the RX line, used by the sniffer.
    fn rx_level(&self) -> bool;
}

/// A 1 MHz hardware timer with an alarm interrupt.
///
/// The driver uses it for the break/mark-after-break reset sequence and for
/// RDM spacing and early-timeout alarms. The integrating firmware routes the
/// alarm interrupt to [`DmxDriver::on_timer_interrupt`](crate::DmxDriver::on_timer_interrupt).
pub trait BusTimer {
    /// Loads the free-running counter, in microseconds.
    fn set_counter(&self, counter_us: u64);
    /// Programs the alarm, optionally reloading the counter to zero when it
    /// fires.
    fn set_alarm(&self, alarm_us: u64, auto_reload: bool);
    fn start(&self);
    fn stop(&self);
}

/// Scheduler and storage services of the host environment.
///
/// The driver blocks caller tasks on their single direct-to-task notification
/// slot and wakes them from interrupt handlers, so the task driving the DMX
/// API must not use that slot for anything else. All functions are associated
/// (no `&self`) because they are reached from interrupt context.
pub trait Platform {
    /// Identifies a blocked task so an ISR can wake it.
    type TaskId: Clone + PartialEq + Send;

    /// Microseconds since boot, monotonic.
    fn micros() -> i64;

    fn current_task() -> Self::TaskId;

    /// Wakes `task`, storing `value` in its notification slot. Must be safe
    /// to call from interrupt context. A second notification before the task
    /// runs overwrites the value.
    fn notify(task: &Self::TaskId, value: u32);

    /// Blocks the current task until notified or until `timeout_us` elapses.
    /// [`WAIT_FOREVER`](crate::consts::WAIT_FOREVER) blocks indefinitely.
    /// Returns the notified value, or `None` on timeout.
    fn wait(timeout_us: u32) -> Option<u32>;

    /// Discards a stale notification left in the current task's slot.
    fn clear_notification();

    /// Lets equal-priority tasks run; used while spinning on the port mutex.
    fn yield_now();

    /// Loads a persisted parameter value. The default implementation
    /// persists nothing.
    fn nvs_load(_port: usize, _pid: u16, _dst: &mut [u8]) -> Option<usize> {
        None
    }

    /// Persists a parameter value. Returns false when the store rejected the
    /// write.
    fn nvs_store(_port: usize, _pid: u16, _data: &[u8]) -> bool {
        true
    }
}
