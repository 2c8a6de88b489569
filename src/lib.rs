//! Pulse generation and acquisition engine for a low-field pulsed [NMR](https://en.wikipedia.org/wiki/Nuclear_magnetic_resonance)
//! experiment on the [RP2040](https://www.raspberrypi.com/products/rp2040/).
//!
//! On command from a host (`NMR(<pulse_ms>,<read_ms>)` over USB serial) the board polarizes the
//! sample, plays a sine burst through a GPIO resistor-ladder DAC, switches the coil to the receive
//! path and streams ADC samples back, bracketed by `0xFFFF` sentinels.
//!
//! The library is hardware independent: the peripherals sit behind the traits in
//! [`components`], so everything except the firmware binary builds and tests on the host.
//!
//! ## Crate features
//!
//! - `defmt`: Logs through [`defmt`](https://docs.rs/defmt) instead of the [`log`] facade.
//! - `rp2040`: Builds the firmware binary (`src/main.rs`). Implies `defmt`.
//! - `trace_samples`: Logs every streamed sample. Very noisy, and slow enough to cause overruns
//!   at high sample rates!
//!
//! ## Demo
//!
//! Wiring the engine together. The firmware does the same with the RP2040 PWM, SIO and ADC
//! peripherals and runs [`TickHandler::on_tick`](interrupt::TickHandler::on_tick) from the trigger
//! interrupt.
//!
//! ```no_run
//! use core::cell::RefCell;
//! # use core::convert::Infallible;
//!
//! use critical_section::Mutex;
//! # use embedded_hal::{delay::DelayNs, digital::{ErrorType, OutputPin}};
//! use pico_nmr::{
//!     buffer::SampleRing,
//!     components::{Relays, SharedTrigger},
//!     console::Console,
//!     interrupt::{RunState, TickHandler},
//!     sequence::{SequenceConfig, SequenceController},
//!     trigger::TriggerCalibration,
//!     waveform::NMR_BOARD_LUT,
//! };
//! # use pico_nmr::{components::{DacPort, SampleSource, TriggerSource}, stream::HostLink};
//! # struct Pwm;
//! # impl TriggerSource for Pwm { fn arm(&mut self, _: u32) {} fn stop(&mut self) {} }
//! # struct SioDac;
//! # impl DacPort for SioDac { fn write_masked(&mut self, _: u32, _: u32) {} }
//! # struct Adc;
//! # impl SampleSource for Adc { fn read_sample(&mut self) -> u16 { 0 } }
//! # struct Pin;
//! # impl ErrorType for Pin { type Error = Infallible; }
//! # impl OutputPin for Pin {
//! #     fn set_low(&mut self) -> Result<(), Infallible> { Ok(()) }
//! #     fn set_high(&mut self) -> Result<(), Infallible> { Ok(()) }
//! # }
//! # struct Timer;
//! # impl DelayNs for Timer { fn delay_ns(&mut self, _: u32) {} }
//! # struct Usb;
//! # impl HostLink for Usb {
//! #     type Error = Infallible;
//! #     fn write_all(&mut self, _: &[u8]) -> Result<(), Infallible> { Ok(()) }
//! # }
//! # impl Usb { fn read(&mut self, _: &mut [u8]) -> usize { 0 } }
//!
//! static RUN_STATE: RunState = RunState::new();
//! static RING: SampleRing<256> = SampleRing::new();
//! static TRIGGER: Mutex<RefCell<Option<Pwm>>> = Mutex::new(RefCell::new(None));
//!
//! fn main() {
//!     critical_section::with(|cs| TRIGGER.replace(cs, Some(Pwm)));
//!     // Moved into the trigger interrupt, which calls `on_tick` once per tick
//!     let _ticks = TickHandler::new(
//!         &RUN_STATE,
//!         &RING,
//!         &NMR_BOARD_LUT,
//!         SioDac,
//!         Adc,
//!         SharedTrigger::new(&TRIGGER),
//!     );
//!
//!     let mut controller = SequenceController::new(
//!         SequenceConfig::default(),
//!         TriggerCalibration::new(125_000_000).with_interval_limits(16, 65_536),
//!         &RUN_STATE,
//!         &RING,
//!         Relays::init(Pin, Pin).unwrap(),
//!         SharedTrigger::new(&TRIGGER),
//!         Timer,
//!     );
//!     let mut host = Usb;
//!     let mut console = Console::new();
//!     console.greet(&mut host).unwrap();
//!     let mut bytes = [0u8; 64];
//!     loop {
//!         let count = host.read(&mut bytes);
//!         console
//!             .feed(&bytes[..count], &mut controller, &mut host, |_| {})
//!             .unwrap();
//!     }
//! }
//! ```

// Copyright 2024 Pico NMR contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), feature(doc_auto_cfg), feature(doc_cfg_hide))]

mod log;

pub mod buffer;
pub mod command;
pub mod components;
pub mod console;
pub mod interrupt;
pub mod sequence;
pub mod stream;
pub mod trigger;
pub mod waveform;
