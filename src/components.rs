//! Hardware boundary: the peripherals the engine drives, as traits, plus the relay pair.
use core::cell::RefCell;

use critical_section::Mutex;
use embedded_hal::digital::{Error as _, ErrorKind, OutputPin};
use thiserror::Error;

use crate::{
    buffer::Sample,
    log::{debug, error},
};

/// Periodic interrupt source driving the tick handler.
///
/// Once armed it fires once per `interval_cycles` until [`stop`](Self::stop) is called.
pub trait TriggerSource {
    /// Start (or keep) firing every `interval_cycles` clock cycles
    fn arm(&mut self, interval_cycles: u32);
    /// Stop firing after the current tick
    fn stop(&mut self);
    /// Acknowledge the interrupt that invoked the handler
    fn clear_pending(&mut self) {}
}

/// Parallel DAC on GPIO.
pub trait DacPort {
    /// Drive the pins in `mask` to the matching bits of `bits`, leaving every other pin alone
    fn write_masked(&mut self, mask: u32, bits: u32);
}

/// Single-channel ADC.
pub trait SampleSource {
    /// Convert and return one reading
    fn read_sample(&mut self) -> Sample;
}

/// [`TriggerSource`] stored in a [`Mutex`] so the tick handler and the sequence controller can
/// both reach the same peripheral.
pub struct SharedTrigger<'a, T> {
    /// Shared slot holding the trigger
    cell: &'a Mutex<RefCell<Option<T>>>,
}

impl<'a, T> SharedTrigger<'a, T> {
    /// Handle to the trigger in `cell`. Calls are dropped while `cell` is empty.
    pub const fn new(cell: &'a Mutex<RefCell<Option<T>>>) -> Self {
        Self { cell }
    }

    /// Run `f` on the trigger inside a critical section
    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        critical_section::with(|cs| self.cell.borrow_ref_mut(cs).as_mut().map(f))
    }
}

impl<T> Clone for SharedTrigger<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SharedTrigger<'_, T> {}

impl<T: TriggerSource> TriggerSource for SharedTrigger<'_, T> {
    fn arm(&mut self, interval_cycles: u32) {
        if self.with(|trigger| trigger.arm(interval_cycles)).is_none() {
            error!("Trigger source has not been initialized");
        }
    }

    fn stop(&mut self) {
        self.with(|trigger| trigger.stop());
    }

    fn clear_pending(&mut self) {
        self.with(|trigger| trigger.clear_pending());
    }
}

/// Position of the read/write relay
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RelayMode {
    /// Coil connected to the receive amplifier and ADC. Pin low.
    Read,
    /// Coil connected to the DAC driver. Pin high.
    Write,
}

/// Which relay output failed
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RelayPin {
    /// Polarization coil enable
    Polarize,
    /// Read/write select
    ReadWrite,
}

/// A relay output could not be driven
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[error("relay output {pin:?} failed: {kind}")]
pub struct RelayError {
    /// Failing output
    pub pin: RelayPin,
    /// Reported cause
    pub kind: ErrorKind,
}

/// Polarization and read/write relays
pub struct Relays<P, RW> {
    /// Polarization coil enable, active high
    polarize: P,
    /// Read/write select, high for [`RelayMode::Write`]
    read_write: RW,
    /// Last successfully selected mode
    mode: RelayMode,
    /// Polarization coil currently on
    polarizing: bool,
}

impl<P: OutputPin, RW: OutputPin> Relays<P, RW> {
    /// Take both outputs and drive them to the safe state: polarization off, read mode.
    pub fn init(polarize: P, read_write: RW) -> Result<Self, RelayError> {
        let mut relays = Self {
            polarize,
            read_write,
            mode: RelayMode::Read,
            polarizing: false,
        };
        relays.safe()?;
        Ok(relays)
    }

    /// Switch the polarization coil
    pub fn polarize(&mut self, on: bool) -> Result<(), RelayError> {
        debug!("Polarization coil -> {}", on);
        self.polarize
            .set_state(on.into())
            .map_err(|err| RelayError {
                pin: RelayPin::Polarize,
                kind: err.kind(),
            })?;
        self.polarizing = on;
        Ok(())
    }

    /// Move the read/write relay
    pub fn select(&mut self, mode: RelayMode) -> Result<(), RelayError> {
        debug!("Read/write relay -> {:?}", mode);
        let result = match mode {
            RelayMode::Read => self.read_write.set_low(),
            RelayMode::Write => self.read_write.set_high(),
        };
        result.map_err(|err| RelayError {
            pin: RelayPin::ReadWrite,
            kind: err.kind(),
        })?;
        self.mode = mode;
        Ok(())
    }

    /// Polarization off and read mode. Both outputs are attempted even if the first fails.
    pub fn safe(&mut self) -> Result<(), RelayError> {
        let polarize = self.polarize(false);
        let select = self.select(RelayMode::Read);
        polarize.and(select)
    }

    /// Last selected read/write mode
    pub fn mode(&self) -> RelayMode {
        self.mode
    }

    /// Whether the polarization coil is on
    pub fn is_polarizing(&self) -> bool {
        self.polarizing
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use core::convert::Infallible;
    use std::{rc::Rc, vec::Vec};

    use embedded_hal::digital::ErrorType;

    use super::*;

    /// Output pin recording every level it was driven to
    #[derive(Default, Clone)]
    pub(crate) struct RecordingPin {
        pub(crate) levels: Rc<RefCell<Vec<bool>>>,
    }

    impl RecordingPin {
        pub(crate) fn level(&self) -> Option<bool> {
            self.levels.borrow().last().copied()
        }
    }

    impl ErrorType for RecordingPin {
        type Error = Infallible;
    }

    impl OutputPin for RecordingPin {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.levels.borrow_mut().push(false);
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            self.levels.borrow_mut().push(true);
            Ok(())
        }
    }

    /// Output pin that always fails
    pub(crate) struct BrokenPin;

    impl ErrorType for BrokenPin {
        type Error = ErrorKind;
    }

    impl OutputPin for BrokenPin {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            Err(ErrorKind::Other)
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            Err(ErrorKind::Other)
        }
    }

    #[derive(Default)]
    struct CountingTrigger {
        armed: Option<u32>,
        stops: u32,
        clears: u32,
    }

    impl TriggerSource for CountingTrigger {
        fn arm(&mut self, interval_cycles: u32) {
            self.armed = Some(interval_cycles);
        }

        fn stop(&mut self) {
            self.armed = None;
            self.stops += 1;
        }

        fn clear_pending(&mut self) {
            self.clears += 1;
        }
    }

    #[test]
    fn relays_start_safe() {
        let polarize = RecordingPin::default();
        let read_write = RecordingPin::default();
        let relays = Relays::init(polarize.clone(), read_write.clone()).unwrap();

        assert_eq!(polarize.level(), Some(false));
        assert_eq!(read_write.level(), Some(false));
        assert_eq!(relays.mode(), RelayMode::Read);
        assert!(!relays.is_polarizing());
    }

    #[test]
    fn write_mode_drives_relay_high() {
        let read_write = RecordingPin::default();
        let mut relays = Relays::init(RecordingPin::default(), read_write.clone()).unwrap();

        relays.select(RelayMode::Write).unwrap();
        assert_eq!(read_write.level(), Some(true));
        relays.polarize(true).unwrap();
        assert!(relays.is_polarizing());

        relays.safe().unwrap();
        assert_eq!(read_write.level(), Some(false));
        assert!(!relays.is_polarizing());
    }

    #[test]
    fn failing_pin_reports_which_relay() {
        let err = Relays::init(RecordingPin::default(), BrokenPin)
            .err()
            .unwrap();
        assert_eq!(
            err,
            RelayError {
                pin: RelayPin::ReadWrite,
                kind: ErrorKind::Other,
            }
        );

        // The polarization output is still attempted when the select fails
        let polarize = RecordingPin::default();
        let _ = Relays::init(polarize.clone(), BrokenPin);
        assert_eq!(polarize.level(), Some(false));
    }

    #[test]
    fn shared_trigger_forwards_to_the_cell() {
        let cell: Mutex<RefCell<Option<CountingTrigger>>> = Mutex::new(RefCell::new(None));
        let mut shared = SharedTrigger::new(&cell);

        // Empty cell: calls are dropped
        shared.arm(100);

        critical_section::with(|cs| cell.replace(cs, Some(CountingTrigger::default())));
        let mut other = shared;
        shared.arm(1234);
        other.clear_pending();
        other.stop();

        let trigger = critical_section::with(|cs| cell.take(cs)).unwrap();
        assert_eq!(trigger.armed, None);
        assert_eq!(trigger.stops, 1);
        assert_eq!(trigger.clears, 1);
    }
}
