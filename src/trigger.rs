//! Conversion of a requested frequency and duration into trigger source settings.

use thiserror::Error;

use crate::{interrupt::Phase, waveform::TICKS_PER_CYCLE};

/// Target-specific constants for turning a tick rate into a trigger interval.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TriggerCalibration {
    /// Frequency of the clock the trigger source counts
    pub sys_clock_hz: u32,
    /// Cycles between arming a tick and its hardware effect, subtracted from every interval
    pub pipeline_offset_cycles: u32,
    /// Shortest interval the tick handler can keep up with
    pub min_interval_cycles: u32,
    /// Longest interval the trigger source can count
    pub max_interval_cycles: u32,
}

impl TriggerCalibration {
    /// Latency of the RP2040 PIO trigger program, in cycles
    pub const DEFAULT_PIPELINE_OFFSET: u32 = 5;

    /// Calibration with the default offset and no interval limits beyond "at least one cycle"
    pub const fn new(sys_clock_hz: u32) -> Self {
        Self {
            sys_clock_hz,
            pipeline_offset_cycles: Self::DEFAULT_PIPELINE_OFFSET,
            min_interval_cycles: 1,
            max_interval_cycles: u32::MAX,
        }
    }

    /// Replace the pipeline offset
    pub const fn with_pipeline_offset(mut self, cycles: u32) -> Self {
        self.pipeline_offset_cycles = cycles;
        self
    }

    /// Restrict the interval to what the trigger source supports. `min` is raised to 1.
    pub const fn with_interval_limits(mut self, min: u32, max: u32) -> Self {
        self.min_interval_cycles = if min == 0 { 1 } else { min };
        self.max_interval_cycles = max;
        self
    }
}

/// Reasons a phase cannot be armed with the requested timing.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimingError {
    /// Phase frequency of 0 Hz
    #[error("frequency must be positive")]
    ZeroFrequency,
    /// `frequency * ticks per period` does not fit in 32 bits
    #[error("tick rate for {frequency_hz} Hz overflows")]
    TickRateOverflow {
        /// Requested frequency
        frequency_hz: u32,
    },
    /// Interval shorter than the calibration allows, or not positive after the pipeline offset
    #[error("{tick_rate_hz} Hz needs an interval of {interval_cycles} cycles, minimum is {min_cycles}")]
    IntervalTooShort {
        /// Requested tick rate
        tick_rate_hz: u32,
        /// Interval after the pipeline offset. May be negative.
        interval_cycles: i64,
        /// Calibration minimum
        min_cycles: u32,
    },
    /// Interval longer than the trigger source can count
    #[error("{tick_rate_hz} Hz needs an interval of {interval_cycles} cycles, maximum is {max_cycles}")]
    IntervalTooLong {
        /// Requested tick rate
        tick_rate_hz: u32,
        /// Interval after the pipeline offset
        interval_cycles: i64,
        /// Calibration maximum
        max_cycles: u32,
    },
    /// The duration rounds to no ticks at all
    #[error("{duration_ms} ms is shorter than one tick")]
    ZeroTicks {
        /// Requested duration
        duration_ms: u32,
    },
    /// The duration needs more ticks than the tick counter holds
    #[error("{duration_ms} ms needs more than 2^32 ticks")]
    TooManyTicks {
        /// Requested duration
        duration_ms: u32,
    },
}

/// Validated settings for one phase, ready to hand to [`RunState::arm`](crate::interrupt::RunState::arm).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TriggerConfig {
    /// Phase to run
    pub phase: Phase,
    /// Ticks per second
    pub tick_rate_hz: u32,
    /// Trigger interval in clock cycles, pipeline offset already applied
    pub interval_cycles: u32,
    /// Ticks until the phase ends, at least 1
    pub total_ticks: u32,
}

impl TriggerConfig {
    /// Excitation at waveform frequency `carrier_hz`. Each waveform cycle takes
    /// [`TICKS_PER_CYCLE`] ticks.
    pub fn excitation(
        calibration: &TriggerCalibration,
        carrier_hz: u32,
        duration_ms: u32,
    ) -> Result<Self, TimingError> {
        Self::compute(
            calibration,
            Phase::Excitation,
            carrier_hz,
            TICKS_PER_CYCLE,
            duration_ms,
        )
    }

    /// Acquisition of one sample per tick at `sample_rate_hz`
    pub fn acquisition(
        calibration: &TriggerCalibration,
        sample_rate_hz: u32,
        duration_ms: u32,
    ) -> Result<Self, TimingError> {
        Self::compute(calibration, Phase::Acquisition, sample_rate_hz, 1, duration_ms)
    }

    /// `interval = round(clock / rate) - offset`, `ticks = round(duration_ms * rate / 1000)`
    fn compute(
        calibration: &TriggerCalibration,
        phase: Phase,
        frequency_hz: u32,
        ticks_per_period: u32,
        duration_ms: u32,
    ) -> Result<Self, TimingError> {
        if frequency_hz == 0 {
            return Err(TimingError::ZeroFrequency);
        }
        let tick_rate_hz = frequency_hz
            .checked_mul(ticks_per_period)
            .ok_or(TimingError::TickRateOverflow { frequency_hz })?;

        let rate = u64::from(tick_rate_hz);
        let cycles_per_tick = (u64::from(calibration.sys_clock_hz) + rate / 2) / rate;
        let interval_cycles =
            cycles_per_tick as i64 - i64::from(calibration.pipeline_offset_cycles);
        if interval_cycles < i64::from(calibration.min_interval_cycles) {
            return Err(TimingError::IntervalTooShort {
                tick_rate_hz,
                interval_cycles,
                min_cycles: calibration.min_interval_cycles,
            });
        }
        if interval_cycles > i64::from(calibration.max_interval_cycles) {
            return Err(TimingError::IntervalTooLong {
                tick_rate_hz,
                interval_cycles,
                max_cycles: calibration.max_interval_cycles,
            });
        }

        let total_ticks = (u64::from(duration_ms) * rate + 500) / 1000;
        if total_ticks == 0 {
            return Err(TimingError::ZeroTicks { duration_ms });
        }
        let total_ticks =
            u32::try_from(total_ticks).map_err(|_| TimingError::TooManyTicks { duration_ms })?;

        Ok(Self {
            phase,
            tick_rate_hz,
            interval_cycles: interval_cycles as u32,
            total_ticks,
        })
    }
}
