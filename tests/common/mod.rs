#![allow(dead_code)]

//! Mock hardware and platform for driving the bus engine on the host. The
//! tests play the role of the silicon: they raise interrupt causes and call
//! the driver's interrupt entry points.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

use dmx_rdm_uart::consts::WAIT_FOREVER;
use dmx_rdm_uart::hal::{intr, BusTimer, Platform, Uart};
use dmx_rdm_uart::{DmxConfig, DmxDriver, PortHardware};

pub type TestDriver = DmxDriver<TestPlatform, MockUart, MockTimer, 1>;

#[derive(Default)]
pub struct NotifySlot {
    value: Mutex<Option<u32>>,
    condvar: Condvar,
}

#[derive(Clone)]
pub struct TaskHandle(Arc<NotifySlot>);

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

thread_local! {
    static SLOT: Arc<NotifySlot> = Arc::new(NotifySlot::default());
}

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Records every value the driver persists through the NVS hook.
pub static NVS_WRITES: Mutex<Vec<(u16, Vec<u8>)>> = Mutex::new(Vec::new());

pub struct TestPlatform;

impl Platform for TestPlatform {
    type TaskId = TaskHandle;

    fn micros() -> i64 {
        EPOCH.get_or_init(Instant::now).elapsed().as_micros() as i64
    }

    fn current_task() -> TaskHandle {
        TaskHandle(SLOT.with(|slot| slot.clone()))
    }

    fn notify(task: &TaskHandle, value: u32) {
        let mut slot = task.0.value.lock().unwrap();
        *slot = Some(value);
        task.0.condvar.notify_all();
    }

    fn wait(timeout_us: u32) -> Option<u32> {
        SLOT.with(|slot| {
            let mut value = slot.value.lock().unwrap();
            if timeout_us == WAIT_FOREVER {
                while value.is_none() {
                    value = slot.condvar.wait(value).unwrap();
                }
            } else {
                let deadline = Instant::now() + Duration::from_micros(timeout_us as u64);
                while value.is_none() {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let (guard, _) = slot
                        .condvar
                        .wait_timeout(value, deadline - now)
                        .unwrap();
                    value = guard;
                }
            }
            value.take()
        })
    }

    fn clear_notification() {
        SLOT.with(|slot| {
            slot.value.lock().unwrap().take();
        });
    }

    fn yield_now() {
        std::thread::yield_now();
    }

    fn nvs_store(_port: usize, pid: u16, data: &[u8]) -> bool {
        NVS_WRITES.lock().unwrap().push((pid, data.to_vec()));
        true
    }
}

#[derive(Default)]
struct UartState {
    enabled: u32,
    status: u32,
    rx_fifo: VecDeque<u8>,
    tx_wire: Vec<u8>,
    rts_listen: bool,
    tx_inverted: bool,
    invert_count: u32,
    baud_rate: u32,
    rx_level: bool,
}

/// A UART whose FIFO accepts everything instantly; transmission completes
/// (TX_DONE becomes pending) as soon as data is written.
#[derive(Clone, Default)]
pub struct MockUart(Arc<Mutex<UartState>>);

impl MockUart {
    pub fn raise(&self, mask: u32) {
        self.0.lock().unwrap().status |= mask;
    }

    pub fn push_rx(&self, bytes: &[u8]) {
        self.0.lock().unwrap().rx_fifo.extend(bytes);
    }

    pub fn wire(&self) -> Vec<u8> {
        self.0.lock().unwrap().tx_wire.clone()
    }

    pub fn clear_wire(&self) {
        self.0.lock().unwrap().tx_wire.clear();
    }

    pub fn rts_listen(&self) -> bool {
        self.0.lock().unwrap().rts_listen
    }

    pub fn tx_inverted(&self) -> bool {
        self.0.lock().unwrap().tx_inverted
    }

    pub fn invert_count(&self) -> u32 {
        self.0.lock().unwrap().invert_count
    }

    pub fn set_rx_level(&self, level: bool) {
        self.0.lock().unwrap().rx_level = level;
    }

    pub fn interrupt_pending(&self) -> bool {
        let state = self.0.lock().unwrap();
        state.status & state.enabled != 0
    }
}

impl Uart for MockUart {
    fn interrupt_status(&self) -> u32 {
        let state = self.0.lock().unwrap();
        state.status & state.enabled
    }

    fn enable_interrupts(&self, mask: u32) {
        self.0.lock().unwrap().enabled |= mask;
    }

    fn disable_interrupts(&self, mask: u32) {
        self.0.lock().unwrap().enabled &= !mask;
    }

    fn clear_interrupts(&self, mask: u32) {
        self.0.lock().unwrap().status &= !mask;
    }

    fn rxfifo_len(&self) -> usize {
        self.0.lock().unwrap().rx_fifo.len()
    }

    fn read_rxfifo(&self, dst: &mut [u8]) -> usize {
        let mut state = self.0.lock().unwrap();
        let mut read = 0;
        while read < dst.len() {
            match state.rx_fifo.pop_front() {
                Some(byte) => {
                    dst[read] = byte;
                    read += 1;
                },
                None => break,
            }
        }
        read
    }

    fn rxfifo_reset(&self) {
        self.0.lock().unwrap().rx_fifo.clear();
    }

    fn txfifo_len(&self) -> usize {
        0
    }

    fn write_txfifo(&self, src: &[u8]) -> usize {
        let mut state = self.0.lock().unwrap();
        state.tx_wire.extend_from_slice(src);
        state.status |= intr::TX_DONE;
        src.len()
    }

    fn set_baud_rate(&self, baud_rate: u32) {
        self.0.lock().unwrap().baud_rate = baud_rate;
    }

    fn baud_rate(&self) -> u32 {
        self.0.lock().unwrap().baud_rate
    }

    fn set_break_bits(&self, _bits: u8) {}

    fn set_idle_bits(&self, _bits: u8) {}

    fn invert_tx(&self, invert: bool) {
        let mut state = self.0.lock().unwrap();
        state.tx_inverted = invert;
        state.invert_count += 1;
    }

    fn get_rts(&self) -> bool {
        self.0.lock().unwrap().rts_listen
    }

    fn set_rts(&self, listen: bool) {
        self.0.lock().unwrap().rts_listen = listen;
    }

    fn rx_level(&self) -> bool {
        self.0.lock().unwrap().rx_level
    }
}

#[derive(Default)]
struct TimerState {
    counter: u64,
    alarm: u64,
    auto_reload: bool,
    running: bool,
}

#[derive(Clone, Default)]
pub struct MockTimer(Arc<Mutex<TimerState>>);

impl MockTimer {
    pub fn is_running(&self) -> bool {
        self.0.lock().unwrap().running
    }

    pub fn alarm(&self) -> u64 {
        self.0.lock().unwrap().alarm
    }

    pub fn counter(&self) -> u64 {
        self.0.lock().unwrap().counter
    }
}

impl BusTimer for MockTimer {
    fn set_counter(&self, counter_us: u64) {
        self.0.lock().unwrap().counter = counter_us;
    }

    fn set_alarm(&self, alarm_us: u64, auto_reload: bool) {
        let mut state = self.0.lock().unwrap();
        state.alarm = alarm_us;
        state.auto_reload = auto_reload;
    }

    fn start(&self) {
        self.0.lock().unwrap().running = true;
    }

    fn stop(&self) {
        self.0.lock().unwrap().running = false;
    }
}

pub struct TestBus {
    pub driver: TestDriver,
    pub uart: MockUart,
    pub timer: MockTimer,
}

/// Builds and installs a one-port driver over mock hardware.
pub fn install_driver(config: &DmxConfig) -> TestBus {
    let uart = MockUart::default();
    let timer = MockTimer::default();
    let driver = DmxDriver::new([PortHardware {
        uart: uart.clone(),
        timer: timer.clone(),
    }]);
    driver.install(0, config).expect("install must succeed");

    TestBus {
        driver,
        uart,
        timer,
    }
}

impl TestBus {
    /// Delivers a frame to the driver the way the silicon would: a break
    /// interrupt, then the data through the receive FIFO.
    pub fn inject_frame(&self, bytes: &[u8]) {
        self.uart.raise(intr::RX_BREAK);
        self.driver.on_uart_interrupt(0);
        self.uart.push_rx(bytes);
        self.uart.raise(intr::RX_DATA);
        self.driver.on_uart_interrupt(0);
    }

    /// Ends the current frame with the break of the next one.
    pub fn inject_break(&self) {
        self.uart.raise(intr::RX_BREAK);
        self.driver.on_uart_interrupt(0);
    }

    /// Plays hardware until `done` holds: fires due timer alarms and services
    /// pending UART interrupts.
    pub fn service_until(&self, done: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(
                Instant::now() < deadline,
                "mock hardware service timed out"
            );
            if self.timer.is_running() {
                self.driver.on_timer_interrupt(0);
            }
            if self.uart.interrupt_pending() {
                self.driver.on_uart_interrupt(0);
            }
            std::thread::yield_now();
        }
    }

    /// Runs an outbound frame to completion: break, mark-after-break, FIFO
    /// hand-off and TX done.
    pub fn finish_transmission(&self) {
        self.service_until(|| self.driver.wait_sent(0, 0) && !self.timer.is_running());
    }
}
