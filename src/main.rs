//! RP2040 firmware: drives the NMR board from commands sent over USB serial.
//!
//! Pin assignment:
//!
//! | GPIO                      | Function                                |
//! |---------------------------|-----------------------------------------|
//! | 29, 6, 7, 0, 1, 2, 4, 3   | DAC bits B0..B7                         |
//! | 26                        | Polarization coil relay, active high    |
//! | 27                        | ADC channel 1, receive amplifier output |
//! | 28                        | Read/write relay, high for write        |
//!
//! Ticks come from the wrap interrupt of PWM slice 0, which counts system clock cycles.
#![no_std]
#![no_main]
#![warn(missing_docs)]

use core::{
    cell::RefCell,
    sync::atomic::{AtomicBool, Ordering},
};

use cortex_m::peripheral::NVIC;
use critical_section::Mutex;
use defmt::{debug, info, warn, Debug2Format};
#[allow(unused_imports)]
use defmt_rtt as _;
use embedded_hal::delay::DelayNs;
use embedded_hal_0_2::adc::OneShot;
use heapless::spsc::{Consumer, Producer, Queue};
#[allow(unused_imports)]
use panic_probe as _;
use pico_nmr::{
    buffer::{Sample, SampleRing},
    components::{DacPort, Relays, SampleSource, SharedTrigger, TriggerSource},
    console::{Console, ConsoleEvent},
    interrupt::{RunState, TickHandler},
    sequence::{SequenceConfig, SequenceController},
    stream::HostLink,
    trigger::TriggerCalibration,
    waveform::NMR_BOARD_LUT,
};
use rp2040_hal::{
    adc::{Adc, AdcPin},
    clocks::init_clocks_and_plls,
    entry,
    gpio::{bank0::Gpio27, DynPinId, FunctionSioInput, FunctionSioOutput, Pin, Pins, PullDown, PullNone},
    pac::{self, interrupt},
    prelude::*,
    pwm::{FreeRunning, Pwm0, Slice, Slices},
    usb::UsbBus,
    Sio, Timer, Watchdog,
};
use static_cell::StaticCell;
use usb_device::{
    bus::UsbBusAllocator,
    device::{StringDescriptors, UsbDevice, UsbDeviceBuilder, UsbDeviceState, UsbVidPid},
    UsbError,
};
use usbd_serial::SerialPort;

/// Second-stage bootloader, from [rp2040-boot2](https://docs.rs/rp2040-boot2)
#[link_section = ".boot2"]
#[used]
pub static BOOT2: [u8; 256] = rp2040_boot2::BOOT_LOADER_W25Q080;
/// External high-speed crystal on the pico board is 12Mhz
pub const XOSC_FREQ_HZ: u32 = 12_000_000;
/// Sample ring capacity: 25.6 ms of headroom at 10 kSPS
const RING_LEN: usize = 256;
/// Fastest tick rate the handler keeps up with, as a PWM interval (100 kHz at 125 MHz)
const MIN_INTERVAL_CYCLES: u32 = 1_250;
/// PWM counter is 16 bits: `top + 1` cycles per wrap
const MAX_INTERVAL_CYCLES: u32 = 1 << 16;
/// Time for the host to open the port after reset
const STARTUP_DELAY_MS: u32 = 4_000;
/// Received bytes held until the foreground picks them up, plus one
const RX_LEN: usize = 128;
/// Bytes queued for the host, plus one. Holds a few full-speed packets.
const TX_LEN: usize = 512;
/// CDC bulk endpoint packet size
const PACKET_LEN: usize = 64;
/// Tick interrupt preempts everything else
const PWM_PRIORITY: u8 = 0x00;
/// USB servicing yields to ticks (the M0+ implements the top two priority bits)
const USB_PRIORITY: u8 = 0x80;

/// Sample source for the tick handler
type AdcInput = OneShotAdc<Pin<Gpio27, FunctionSioInput, PullNone>>;
/// Tick handler as installed in [`TICK`]
type Ticker = TickHandler<'static, SioDac, AdcInput, SharedTrigger<'static, PwmTrigger>, RING_LEN>;

/// Shared with the tick handler
static RUN_STATE: RunState = RunState::new();
/// Acquired samples, filled by [`PWM_IRQ_WRAP`]
static RING: SampleRing<RING_LEN> = SampleRing::new();
/// Trigger source, reached by both the tick handler and the sequence controller
static TRIGGER: Mutex<RefCell<Option<PwmTrigger>>> = Mutex::new(RefCell::new(None));
/// Tick handler, run from [`PWM_IRQ_WRAP`]
static TICK: Mutex<RefCell<Option<Ticker>>> = Mutex::new(RefCell::new(None));
/// USB device, handed to [`USBCTRL_IRQ`] on its first run
static USB: Mutex<RefCell<Option<UsbTask>>> = Mutex::new(RefCell::new(None));
/// Set by [`USBCTRL_IRQ`] while the host has the port configured
static USB_CONFIGURED: AtomicBool = AtomicBool::new(false);
/// Host to board bytes
static RX_QUEUE: StaticCell<Queue<u8, RX_LEN>> = StaticCell::new();
/// Board to host bytes
static TX_QUEUE: StaticCell<Queue<u8, TX_LEN>> = StaticCell::new();
/// USB bus allocator, borrowed by the device and the serial class for the program lifetime
static USB_BUS: StaticCell<UsbBusAllocator<UsbBus>> = StaticCell::new();

/// PWM slice used as a periodic tick source
struct PwmTrigger {
    /// Slice counting system clock cycles
    slice: Slice<Pwm0, FreeRunning>,
    /// Counting and raising wrap interrupts
    running: bool,
}

impl TriggerSource for PwmTrigger {
    fn arm(&mut self, interval_cycles: u32) {
        // Takes effect at the next wrap, so re-arming a running slice does not disturb the period
        self.slice
            .set_top(interval_cycles.clamp(1, MAX_INTERVAL_CYCLES).wrapping_sub(1) as u16);
        if !self.running {
            self.slice.set_counter(0);
            self.slice.clear_interrupt();
            self.slice.enable_interrupt();
            self.slice.enable();
            self.running = true;
        }
    }

    fn stop(&mut self) {
        self.slice.disable();
        self.slice.disable_interrupt();
        self.running = false;
    }

    fn clear_pending(&mut self) {
        self.slice.clear_interrupt();
    }
}

/// Resistor-ladder DAC on SIO outputs
struct SioDac {
    /// Held so nothing else reconfigures the DAC pins
    _pins: [Pin<DynPinId, FunctionSioOutput, PullDown>; 8],
}

impl DacPort for SioDac {
    #[inline]
    fn write_masked(&mut self, mask: u32, bits: u32) {
        // SAFETY: the XOR alias only flips bits inside `mask`, and every pin in it is owned here
        let sio = unsafe { &*pac::SIO::ptr() };
        let current = sio.gpio_out().read().bits();
        sio.gpio_out_xor()
            .write(|w| unsafe { w.bits((current ^ bits) & mask) });
    }
}

/// Blocking single conversions on one ADC channel
struct OneShotAdc<P> {
    /// ADC peripheral
    adc: Adc,
    /// Selected input
    pin: AdcPin<P>,
}

impl<P> SampleSource for OneShotAdc<P>
where
    Adc: OneShot<Adc, u16, AdcPin<P>>,
{
    #[inline]
    fn read_sample(&mut self) -> Sample {
        nb::block!(self.adc.read(&mut self.pin)).unwrap_or_default()
    }
}

/// USB device with its CDC class. Owned by [`USBCTRL_IRQ`], which is the only place the USB
/// peripheral is touched after startup.
struct UsbTask {
    /// Device state machine
    device: UsbDevice<'static, UsbBus>,
    /// CDC ACM class
    serial: SerialPort<'static, UsbBus>,
    /// Received bytes, consumed by [`UsbHost::receive`]
    rx: Producer<'static, u8, RX_LEN>,
    /// Bytes written by [`UsbHost`]
    tx: Consumer<'static, u8, TX_LEN>,
    /// Dequeued from `tx`, not yet accepted by the endpoint
    pending: heapless::Vec<u8, PACKET_LEN>,
}

impl UsbTask {
    /// Poll the device, queue received bytes and push queued bytes into the endpoint
    fn service(&mut self) {
        if self.device.poll(&mut [&mut self.serial]) {
            let mut buf = [0u8; PACKET_LEN];
            if let Ok(count) = self.serial.read(&mut buf) {
                for &byte in &buf[..count] {
                    if self.rx.enqueue(byte).is_err() {
                        warn!("USB receive queue full, input dropped");
                        break;
                    }
                }
            }
        }

        let configured = self.device.state() == UsbDeviceState::Configured;
        USB_CONFIGURED.store(configured, Ordering::Relaxed);
        if !configured {
            self.pending.clear();
            while self.tx.dequeue().is_some() {}
            return;
        }

        loop {
            while !self.pending.is_full() {
                match self.tx.dequeue() {
                    Some(byte) => {
                        let _ = self.pending.push(byte);
                    }
                    None => break,
                }
            }
            if self.pending.is_empty() {
                return;
            }
            match self.serial.write(&self.pending) {
                Ok(count) if count > 0 => {
                    let remaining = self.pending.len() - count;
                    self.pending.rotate_left(count);
                    self.pending.truncate(remaining);
                }
                // Endpoint busy, the next transfer-complete interrupt continues
                _ => return,
            }
        }
    }
}

/// [`HostLink`] over the queues shared with [`USBCTRL_IRQ`]
struct UsbHost {
    /// Received bytes
    rx: Consumer<'static, u8, RX_LEN>,
    /// Bytes for the host
    tx: Producer<'static, u8, TX_LEN>,
}

impl UsbHost {
    /// Move every received byte into `bytes`
    fn receive(&mut self, bytes: &mut heapless::Vec<u8, RX_LEN>) {
        while !bytes.is_full() {
            match self.rx.dequeue() {
                Some(byte) => {
                    let _ = bytes.push(byte);
                }
                None => break,
            }
        }
    }
}

impl HostLink for UsbHost {
    type Error = UsbError;

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        if !USB_CONFIGURED.load(Ordering::Relaxed) {
            return Err(UsbError::InvalidState);
        }
        for &byte in bytes {
            while self.tx.enqueue(byte).is_err() {
                if !USB_CONFIGURED.load(Ordering::Relaxed) {
                    return Err(UsbError::InvalidState);
                }
                NVIC::pend(pac::Interrupt::USBCTRL_IRQ);
            }
        }
        NVIC::pend(pac::Interrupt::USBCTRL_IRQ);
        Ok(())
    }
}

/// Main operation loop
#[entry]
fn main() -> ! {
    info!("NMR controller startup");
    let mut pac = pac::Peripherals::take().unwrap();
    let mut core = pac::CorePeripherals::take().unwrap();
    let mut watchdog = Watchdog::new(pac.WATCHDOG);
    let sio = Sio::new(pac.SIO);

    let clocks = init_clocks_and_plls(
        XOSC_FREQ_HZ,
        pac.XOSC,
        pac.CLOCKS,
        pac.PLL_SYS,
        pac.PLL_USB,
        &mut pac.RESETS,
        &mut watchdog,
    )
    .ok()
    .unwrap();
    let sys_clock_hz = clocks.system_clock.freq().to_Hz();
    let mut timer = Timer::new(pac.TIMER, &mut pac.RESETS, &clocks);
    let pins = Pins::new(
        pac.IO_BANK0,
        pac.PADS_BANK0,
        sio.gpio_bank0,
        &mut pac.RESETS,
    );

    // Relays first, so the coil is never left energized
    let relays = Relays::init(
        pins.gpio26.into_push_pull_output(),
        pins.gpio28.into_push_pull_output(),
    )
    .unwrap();

    // Same order as `DacPinMap::NMR_BOARD`, least significant bit first
    let mut dac = SioDac {
        _pins: [
            pins.gpio29.into_push_pull_output().into_dyn_pin(),
            pins.gpio6.into_push_pull_output().into_dyn_pin(),
            pins.gpio7.into_push_pull_output().into_dyn_pin(),
            pins.gpio0.into_push_pull_output().into_dyn_pin(),
            pins.gpio1.into_push_pull_output().into_dyn_pin(),
            pins.gpio2.into_push_pull_output().into_dyn_pin(),
            pins.gpio4.into_push_pull_output().into_dyn_pin(),
            pins.gpio3.into_push_pull_output().into_dyn_pin(),
        ],
    };
    // Park the DAC at mid-scale
    dac.write_masked(NMR_BOARD_LUT.mask(), NMR_BOARD_LUT.pattern(128));

    let adc = OneShotAdc {
        adc: Adc::new(pac.ADC, &mut pac.RESETS),
        pin: AdcPin::new(pins.gpio27.into_floating_input()).ok().unwrap(),
    };

    // Trigger source and tick handler
    let pwm_slices = Slices::new(pac.PWM, &mut pac.RESETS);
    debug!("critical_section: init trigger and tick handler");
    critical_section::with(|cs| {
        TRIGGER.replace(
            cs,
            Some(PwmTrigger {
                slice: pwm_slices.pwm0,
                running: false,
            }),
        );
        TICK.replace(
            cs,
            Some(TickHandler::new(
                &RUN_STATE,
                &RING,
                &NMR_BOARD_LUT,
                dac,
                adc,
                SharedTrigger::new(&TRIGGER),
            )),
        );
    });

    // USB serial
    let usb_bus = USB_BUS.init(UsbBusAllocator::new(UsbBus::new(
        pac.USBCTRL_REGS,
        pac.USBCTRL_DPRAM,
        clocks.usb_clock,
        true,
        &mut pac.RESETS,
    )));
    let serial = SerialPort::new(usb_bus);
    let device = UsbDeviceBuilder::new(usb_bus, UsbVidPid(0x2e8a, 0x000a))
        .strings(&[StringDescriptors::default()
            .manufacturer("Pico NMR")
            .product("NMR controller")
            .serial_number("0001")])
        .unwrap()
        .device_class(usbd_serial::USB_CLASS_CDC)
        .build();
    let (rx_producer, rx_consumer) = RX_QUEUE.init(Queue::new()).split();
    let (tx_producer, tx_consumer) = TX_QUEUE.init(Queue::new()).split();
    debug!("critical_section: init USB serial");
    critical_section::with(|cs| {
        USB.replace(
            cs,
            Some(UsbTask {
                device,
                serial,
                rx: rx_producer,
                tx: tx_consumer,
                pending: heapless::Vec::new(),
            }),
        )
    });

    // PWM wraps are cycle exact, nothing to compensate
    let calibration = TriggerCalibration::new(sys_clock_hz)
        .with_pipeline_offset(0)
        .with_interval_limits(MIN_INTERVAL_CYCLES, MAX_INTERVAL_CYCLES);
    let mut controller = SequenceController::new(
        SequenceConfig::default(),
        calibration,
        &RUN_STATE,
        &RING,
        relays,
        SharedTrigger::new(&TRIGGER),
        timer,
    );

    // SAFETY: each handler takes sole ownership of its peripherals on first run, everything else
    // it reaches is atomic, a lock-free queue or behind `critical_section`
    unsafe {
        core.NVIC
            .set_priority(pac::Interrupt::PWM_IRQ_WRAP, PWM_PRIORITY);
        core.NVIC
            .set_priority(pac::Interrupt::USBCTRL_IRQ, USB_PRIORITY);
        NVIC::unmask(pac::Interrupt::USBCTRL_IRQ);
        NVIC::unmask(pac::Interrupt::PWM_IRQ_WRAP);
    }

    timer.delay_ms(STARTUP_DELAY_MS);
    let mut host = UsbHost {
        rx: rx_consumer,
        tx: tx_producer,
    };
    let mut console = Console::new();
    if let Err(err) = console.greet(&mut host) {
        warn!("Host not connected yet: {}", Debug2Format(&err));
    }
    info!("System clock at {=u32} Hz, waiting for commands", sys_clock_hz);

    let mut bytes = heapless::Vec::<u8, RX_LEN>::new();
    loop {
        bytes.clear();
        host.receive(&mut bytes);
        if bytes.is_empty() {
            continue;
        }
        let fed = console.feed(&bytes, &mut controller, &mut host, |event| match event {
            ConsoleEvent::Rejected(err) => debug!("Rejected: {}", err),
            ConsoleEvent::Ran { command, outcome } => match outcome {
                Ok(report) => debug!("{}: {}", command, report),
                Err(err) => warn!("{}: {}", command, err),
            },
        });
        if let Err(err) = fed {
            warn!("Host link error: {}", Debug2Format(&err));
        }
    }
}

/// Runs the tick handler once per PWM wrap
#[interrupt]
fn PWM_IRQ_WRAP() {
    static mut TICKER: Option<Ticker> = None;
    if TICKER.is_none() {
        *TICKER = critical_section::with(|cs| TICK.take(cs));
    }
    if let Some(ticker) = TICKER {
        ticker.on_tick();
    }
}

/// Services the USB device. Runs below [`PWM_IRQ_WRAP`] and holds no critical section, so ticks
/// preempt it.
#[interrupt]
fn USBCTRL_IRQ() {
    static mut TASK: Option<UsbTask> = None;
    if TASK.is_none() {
        *TASK = critical_section::with(|cs| USB.take(cs));
    }
    if let Some(task) = TASK {
        task.service();
    }
}
