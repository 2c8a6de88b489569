//! State shared with the tick interrupt, and the tick handler itself.
//!
//! [`RunState`] is the only channel between the foreground and the interrupt. Every field is an
//! atomic with a single writer at any time:
//!
//! - while idle (`pulse_ended`), the foreground owns everything and writes it in
//!   [`RunState::arm`];
//! - while a phase runs, the tick handler owns `trigger_count`, `phase` and `pulse_ended`, and the
//!   foreground only reads.
//!
//! Publishing `pulse_ended = false` (Release) hands ownership to the handler; the handler hands
//! it back by publishing `pulse_ended = true` after its last action.
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use thiserror::Error;

use crate::{
    buffer::SampleRing,
    components::{DacPort, SampleSource, TriggerSource},
    log::debug,
    trigger::TriggerConfig,
    waveform::DacLut,
};

/// What the tick handler does on each tick
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Phase {
    /// Nothing armed
    Idle = 0,
    /// Play the sine table on the DAC
    Excitation = 1,
    /// Capture one ADC sample per tick
    Acquisition = 2,
}

impl Phase {
    /// Inverse of `phase as u8`. Unknown values read as [`Phase::Idle`].
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Excitation,
            2 => Self::Acquisition,
            _ => Self::Idle,
        }
    }
}

/// A phase could not be armed
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ArmError {
    /// A phase is still running. Nothing was changed.
    #[error("{phase:?} phase still running ({trigger_count}/{length_pulse} ticks)")]
    Busy {
        /// Running phase
        phase: Phase,
        /// Ticks fired so far
        trigger_count: u32,
        /// Ticks the running phase needs
        length_pulse: u32,
    },
    /// Only excitation and acquisition can be armed
    #[error("cannot arm the idle phase")]
    IdlePhase,
}

/// Counters and flags shared between the tick handler and the sequence controller.
pub struct RunState {
    /// Ticks fired since the phase was armed
    trigger_count: AtomicU32,
    /// Ticks the armed phase needs
    length_pulse: AtomicU32,
    /// Interval handed to the trigger source on every re-arm
    interval_cycles: AtomicU32,
    /// [`Phase`] as `u8`
    phase: AtomicU8,
    /// `true` while idle and once a phase has finished
    pulse_ended: AtomicBool,
}

impl RunState {
    /// Idle state. Usable in a `static`.
    pub const fn new() -> Self {
        Self {
            trigger_count: AtomicU32::new(0),
            length_pulse: AtomicU32::new(0),
            interval_cycles: AtomicU32::new(0),
            phase: AtomicU8::new(Phase::Idle as u8),
            pulse_ended: AtomicBool::new(true),
        }
    }

    /// `true` when no phase is running
    #[inline]
    pub fn pulse_ended(&self) -> bool {
        self.pulse_ended.load(Ordering::Acquire)
    }

    /// Currently running phase
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Ticks fired in the current (or last) phase
    pub fn trigger_count(&self) -> u32 {
        self.trigger_count.load(Ordering::Acquire)
    }

    /// Ticks required by the current (or last) phase
    pub fn length_pulse(&self) -> u32 {
        self.length_pulse.load(Ordering::Acquire)
    }

    /// Trigger interval of the current (or last) phase
    pub fn interval_cycles(&self) -> u32 {
        self.interval_cycles.load(Ordering::Relaxed)
    }

    /// Start a phase: load its parameters, hand ownership to the tick handler and fire the first
    /// arm on `trigger`.
    ///
    /// Refused with [`ArmError::Busy`] while another phase runs; the running phase is not
    /// touched.
    pub fn arm<T: TriggerSource>(
        &self,
        config: &TriggerConfig,
        trigger: &mut T,
    ) -> Result<(), ArmError> {
        if !self.pulse_ended() {
            return Err(ArmError::Busy {
                phase: self.phase(),
                trigger_count: self.trigger_count(),
                length_pulse: self.length_pulse(),
            });
        }
        if config.phase == Phase::Idle {
            return Err(ArmError::IdlePhase);
        }

        debug!(
            "Arming {:?}: {} ticks every {} cycles",
            config.phase, config.total_ticks, config.interval_cycles
        );
        self.length_pulse
            .store(config.total_ticks, Ordering::Relaxed);
        self.interval_cycles
            .store(config.interval_cycles, Ordering::Relaxed);
        self.trigger_count.store(0, Ordering::Relaxed);
        self.phase.store(config.phase as u8, Ordering::Relaxed);
        self.pulse_ended.store(false, Ordering::Release);

        trigger.arm(config.interval_cycles);
        Ok(())
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of one [`TickHandler::on_tick`]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TickOutcome {
    /// Action performed, next tick armed
    Continued,
    /// Action performed on the final tick, trigger stopped, `pulse_ended` published
    Finished,
    /// Tick arrived with nothing armed. Trigger stopped, nothing else touched.
    Spurious,
}

/// Per-tick real-time routine. Owns the DAC, the ADC and a handle to the trigger source.
///
/// [`on_tick`](Self::on_tick) has no loops, no logging and no failure paths; every input is
/// validated by [`TriggerConfig`] before a phase is armed.
pub struct TickHandler<'a, D, A, T, const N: usize> {
    /// Shared counters
    state: &'a RunState,
    /// Destination of acquired samples
    ring: &'a SampleRing<N>,
    /// Amplitude to GPIO pattern table
    lut: &'a DacLut,
    /// Excitation output
    dac: D,
    /// Acquisition input
    adc: A,
    /// Tick source, re-armed or stopped on every tick
    trigger: T,
}

impl<'a, D, A, T, const N: usize> TickHandler<'a, D, A, T, N>
where
    D: DacPort,
    A: SampleSource,
    T: TriggerSource,
{
    /// Assemble the handler
    pub fn new(
        state: &'a RunState,
        ring: &'a SampleRing<N>,
        lut: &'a DacLut,
        dac: D,
        adc: A,
        trigger: T,
    ) -> Self {
        Self {
            state,
            ring,
            lut,
            dac,
            adc,
            trigger,
        }
    }

    /// Handle one tick.
    ///
    /// The stop/re-arm decision comes first so the next tick is scheduled as early as possible;
    /// the tick that meets the stop condition still performs its action, and `pulse_ended` only
    /// becomes visible after it.
    #[inline]
    pub fn on_tick(&mut self) -> TickOutcome {
        if self.state.pulse_ended.load(Ordering::Acquire) {
            self.trigger.stop();
            self.trigger.clear_pending();
            return TickOutcome::Spurious;
        }

        let count = self.state.trigger_count.load(Ordering::Relaxed);
        let length = self.state.length_pulse.load(Ordering::Relaxed);
        let last = count >= length.saturating_sub(1);
        if last {
            self.trigger.stop();
        } else {
            self.trigger
                .arm(self.state.interval_cycles.load(Ordering::Relaxed));
        }

        match Phase::from_u8(self.state.phase.load(Ordering::Relaxed)) {
            Phase::Acquisition => {
                // Overruns are counted by the ring
                let _ = self.ring.push(self.adc.read_sample());
            }
            Phase::Excitation => {
                self.dac
                    .write_masked(self.lut.mask(), self.lut.sine_pattern(count));
            }
            Phase::Idle => {}
        }

        self.state
            .trigger_count
            .store(count.wrapping_add(1), Ordering::Release);

        if last {
            self.state
                .phase
                .store(Phase::Idle as u8, Ordering::Relaxed);
            self.state.pulse_ended.store(true, Ordering::Release);
        }

        self.trigger.clear_pending();
        if last {
            TickOutcome::Finished
        } else {
            TickOutcome::Continued
        }
    }

    /// Give the peripherals back
    pub fn release(self) -> (D, A, T) {
        (self.dac, self.adc, self.trigger)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::vec::Vec;

    use super::*;
    use crate::{
        trigger::TriggerCalibration,
        waveform::{NMR_BOARD_LUT, SINE_LUT_16},
    };

    /// Trigger source that only records what it was told
    #[derive(Default, Debug)]
    pub(crate) struct ScriptedTrigger {
        pub(crate) running: bool,
        pub(crate) arms: Vec<u32>,
        pub(crate) stops: u32,
        pub(crate) clears: u32,
    }

    impl TriggerSource for ScriptedTrigger {
        fn arm(&mut self, interval_cycles: u32) {
            self.running = true;
            self.arms.push(interval_cycles);
        }

        fn stop(&mut self) {
            self.running = false;
            self.stops += 1;
        }

        fn clear_pending(&mut self) {
            self.clears += 1;
        }
    }

    /// DAC keeping every write
    #[derive(Default)]
    pub(crate) struct CapturingDac {
        pub(crate) writes: Vec<(u32, u32)>,
    }

    impl DacPort for CapturingDac {
        fn write_masked(&mut self, mask: u32, bits: u32) {
            self.writes.push((mask, bits));
        }
    }

    /// ADC counting up from a start value
    pub(crate) struct RampAdc(pub(crate) u16);

    impl SampleSource for RampAdc {
        fn read_sample(&mut self) -> u16 {
            let sample = self.0;
            self.0 = (self.0 + 1) & crate::buffer::ADC_MAX;
            sample
        }
    }

    const CALIBRATION: TriggerCalibration = TriggerCalibration::new(125_000_000);

    /// Fire ticks until the handler reports the end, checking the flag stays low before that
    fn run_to_end<D: DacPort, A: SampleSource, const N: usize>(
        handler: &mut TickHandler<'_, D, A, ScriptedTrigger, N>,
        state: &RunState,
    ) -> u32 {
        let mut ticks = 0;
        loop {
            assert!(!state.pulse_ended());
            ticks += 1;
            match handler.on_tick() {
                TickOutcome::Continued => {}
                TickOutcome::Finished => return ticks,
                TickOutcome::Spurious => panic!("tick {ticks} was spurious"),
            }
        }
    }

    #[test]
    fn acquisition_fires_exactly_length_ticks() {
        let state = RunState::new();
        let ring = SampleRing::<1024>::new();
        let config = TriggerConfig::acquisition(&CALIBRATION, 10_000, 50).unwrap();
        let mut arming = ScriptedTrigger::default();
        state.arm(&config, &mut arming).unwrap();
        assert_eq!(arming.arms, [config.interval_cycles]);

        let mut handler = TickHandler::new(
            &state,
            &ring,
            &NMR_BOARD_LUT,
            CapturingDac::default(),
            RampAdc(0),
            ScriptedTrigger::default(),
        );
        let ticks = run_to_end(&mut handler, &state);

        assert_eq!(ticks, 500);
        assert!(state.pulse_ended());
        assert_eq!(state.phase(), Phase::Idle);
        assert_eq!(state.trigger_count(), 500);
        assert_eq!(ring.len(), 500);
        assert!(ring.drain().eq(0..500));

        let (dac, _, trigger) = handler.release();
        assert!(dac.writes.is_empty());
        assert_eq!(trigger.arms.len(), 499);
        assert_eq!(trigger.stops, 1);
        assert_eq!(trigger.clears, 500);
        assert!(!trigger.running);
    }

    #[test]
    fn final_tick_still_performs_its_action() {
        let state = RunState::new();
        let ring = SampleRing::<4>::new();
        // Single-tick phase: the first tick is also the last one
        let config = TriggerConfig {
            phase: Phase::Acquisition,
            tick_rate_hz: 10_000,
            interval_cycles: 12_495,
            total_ticks: 1,
        };
        state.arm(&config, &mut ScriptedTrigger::default()).unwrap();
        let mut handler = TickHandler::new(
            &state,
            &ring,
            &NMR_BOARD_LUT,
            CapturingDac::default(),
            RampAdc(77),
            ScriptedTrigger::default(),
        );
        assert_eq!(handler.on_tick(), TickOutcome::Finished);
        assert!(state.pulse_ended());
        assert_eq!(ring.pop(), Some(77));
    }

    #[test]
    fn excitation_plays_the_sine_table() {
        let state = RunState::new();
        let ring = SampleRing::<4>::new();
        let config = TriggerConfig::excitation(&CALIBRATION, 1701, 2).unwrap();
        // 2 ms * 27 216 Hz = 54.4
        assert_eq!(config.total_ticks, 54);
        state.arm(&config, &mut ScriptedTrigger::default()).unwrap();

        let mut handler = TickHandler::new(
            &state,
            &ring,
            &NMR_BOARD_LUT,
            CapturingDac::default(),
            RampAdc(0),
            ScriptedTrigger::default(),
        );
        assert_eq!(run_to_end(&mut handler, &state), 54);
        assert!(ring.is_empty());

        let (dac, _, _) = handler.release();
        assert_eq!(dac.writes.len(), 54);
        for (tick, &(mask, bits)) in dac.writes.iter().enumerate() {
            assert_eq!(mask, NMR_BOARD_LUT.mask());
            assert_eq!(
                NMR_BOARD_LUT.pin_map().decode(bits),
                SINE_LUT_16[tick % SINE_LUT_16.len()]
            );
        }
    }

    #[test]
    fn arming_while_running_is_rejected_without_side_effects() {
        let state = RunState::new();
        let ring = SampleRing::<16>::new();
        let running = TriggerConfig::acquisition(&CALIBRATION, 10_000, 1).unwrap();
        state.arm(&running, &mut ScriptedTrigger::default()).unwrap();

        let mut handler = TickHandler::new(
            &state,
            &ring,
            &NMR_BOARD_LUT,
            CapturingDac::default(),
            RampAdc(0),
            ScriptedTrigger::default(),
        );
        for _ in 0..3 {
            handler.on_tick();
        }

        let intruder = TriggerConfig::excitation(&CALIBRATION, 1701, 100).unwrap();
        let mut trigger = ScriptedTrigger::default();
        assert_eq!(
            state.arm(&intruder, &mut trigger),
            Err(ArmError::Busy {
                phase: Phase::Acquisition,
                trigger_count: 3,
                length_pulse: 10,
            })
        );
        assert!(trigger.arms.is_empty());
        assert_eq!(state.trigger_count(), 3);
        assert_eq!(state.length_pulse(), 10);
        assert_eq!(state.interval_cycles(), running.interval_cycles);
        assert_eq!(state.phase(), Phase::Acquisition);

        // The running phase still finishes on schedule
        let mut ticks = 3;
        while handler.on_tick() != TickOutcome::Finished {
            ticks += 1;
        }
        assert_eq!(ticks + 1, 10);
        assert!(state.arm(&intruder, &mut trigger).is_ok());
    }

    #[test]
    fn tick_while_idle_is_spurious() {
        let state = RunState::new();
        let ring = SampleRing::<4>::new();
        let mut handler = TickHandler::new(
            &state,
            &ring,
            &NMR_BOARD_LUT,
            CapturingDac::default(),
            RampAdc(0),
            ScriptedTrigger::default(),
        );
        assert_eq!(handler.on_tick(), TickOutcome::Spurious);
        assert_eq!(state.trigger_count(), 0);
        assert!(ring.is_empty());
        let (_, _, trigger) = handler.release();
        assert_eq!(trigger.stops, 1);
        assert_eq!(trigger.clears, 1);
    }

    #[test]
    fn idle_phase_cannot_be_armed() {
        let state = RunState::new();
        let config = TriggerConfig {
            phase: Phase::Idle,
            tick_rate_hz: 1,
            interval_cycles: 1,
            total_ticks: 1,
        };
        assert_eq!(
            state.arm(&config, &mut ScriptedTrigger::default()),
            Err(ArmError::IdlePhase)
        );
        assert!(state.pulse_ended());
    }
}
