//! Blocking polarize → excite → read sequence.
use embedded_hal::{delay::DelayNs, digital::OutputPin};
use thiserror::Error;

#[cfg(feature = "trace_samples")]
use crate::log::trace;
use crate::{
    buffer::SampleRing,
    command::NmrCommand,
    components::{RelayError, RelayMode, Relays, TriggerSource},
    interrupt::{ArmError, RunState},
    log::{debug, error, info, warn},
    stream::{HostLink, SampleStream},
    trigger::{TimingError, TriggerCalibration, TriggerConfig},
};

/// Sequence timing. Defaults match the NMR driver board.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SequenceConfig {
    /// How long the polarization coil stays on
    pub polarize_ms: u32,
    /// Settling time after every read/write relay switch
    pub relay_settle_ms: u32,
    /// Excitation waveform frequency
    pub carrier_hz: u32,
    /// Acquisition sample rate
    pub sample_rate_hz: u32,
    /// Fail the sequence if any sample was dropped, instead of only warning
    pub fail_on_overrun: bool,
}

impl SequenceConfig {
    /// Default polarization time
    pub const POLARIZE_MS: u32 = 5000;
    /// Default relay settling time
    pub const RELAY_SETTLE_MS: u32 = 10;
    /// Default excitation carrier
    pub const CARRIER_HZ: u32 = 1701;
    /// Default acquisition rate
    pub const SAMPLE_RATE_HZ: u32 = 10_000;
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            polarize_ms: Self::POLARIZE_MS,
            relay_settle_ms: Self::RELAY_SETTLE_MS,
            carrier_hz: Self::CARRIER_HZ,
            sample_rate_hz: Self::SAMPLE_RATE_HZ,
            fail_on_overrun: false,
        }
    }
}

/// Where the controller is in a sequence
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SequenceState {
    /// Waiting for a command
    Idle,
    /// Polarization coil on
    Polarizing,
    /// Relay to write, excitation being armed
    ArmingExcitation,
    /// Waiting for the excitation phase to end
    Exciting,
    /// Relay to read, acquisition being armed
    ArmingAcquisition,
    /// Streaming samples while the acquisition runs
    Reading,
    /// Closing the stream
    Finalizing,
}

/// Outcome of a completed sequence
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SequenceReport {
    /// Ticks played during excitation
    pub excitation_ticks: u32,
    /// Samples written to the host
    pub samples_streamed: u32,
    /// Samples lost to a full ring
    pub samples_dropped: u32,
    /// Highest ring occupancy seen while streaming
    pub peak_fill: u32,
}

/// Why a sequence was refused or aborted
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SequenceError {
    /// Requested timing cannot be produced. Nothing was touched.
    #[error("invalid timing: {0}")]
    Timing(#[from] TimingError),
    /// A phase is still running
    #[error("busy: {0}")]
    Busy(#[from] ArmError),
    /// A relay output failed
    #[error("relay failure: {0}")]
    Relay(#[from] RelayError),
    /// Writing to the host failed. The sequence still ran to completion.
    #[error("host link write failed")]
    Link,
    /// Samples were dropped and [`SequenceConfig::fail_on_overrun`] is set
    #[error("{dropped} samples dropped")]
    Overrun {
        /// Samples lost
        dropped: u32,
    },
}

/// Runs one NMR sequence per command. Owns the relays, the foreground handle to the trigger
/// source and a delay provider.
pub struct SequenceController<'a, P, RW, T, D, const N: usize> {
    /// Timing parameters
    config: SequenceConfig,
    /// Trigger interval calibration
    calibration: TriggerCalibration,
    /// Shared with the tick handler
    run_state: &'a RunState,
    /// Filled by the tick handler
    ring: &'a SampleRing<N>,
    /// Polarization and read/write relays
    relays: Relays<P, RW>,
    /// Used only to fire the first tick of a phase
    trigger: T,
    /// Blocking delays for polarization and relay settling
    delay: D,
    /// Current step
    state: SequenceState,
}

impl<'a, P, RW, T, D, const N: usize> SequenceController<'a, P, RW, T, D, N>
where
    P: OutputPin,
    RW: OutputPin,
    T: TriggerSource,
    D: DelayNs,
{
    /// Assemble the controller. `relays` should already be in the safe state.
    pub fn new(
        config: SequenceConfig,
        calibration: TriggerCalibration,
        run_state: &'a RunState,
        ring: &'a SampleRing<N>,
        relays: Relays<P, RW>,
        trigger: T,
        delay: D,
    ) -> Self {
        Self {
            config,
            calibration,
            run_state,
            ring,
            relays,
            trigger,
            delay,
            state: SequenceState::Idle,
        }
    }

    /// Current step
    pub fn state(&self) -> SequenceState {
        self.state
    }

    /// Relay pair, for inspection
    pub fn relays(&self) -> &Relays<P, RW> {
        &self.relays
    }

    /// Validate both phases of `command` without touching any hardware
    pub fn plan(&self, command: NmrCommand) -> Result<(TriggerConfig, TriggerConfig), TimingError> {
        let excitation =
            TriggerConfig::excitation(&self.calibration, self.config.carrier_hz, command.pulse_ms)?;
        let acquisition = TriggerConfig::acquisition(
            &self.calibration,
            self.config.sample_rate_hz,
            command.read_ms,
        )?;
        Ok((excitation, acquisition))
    }

    /// Run a complete sequence, streaming the acquisition to `link`. Blocks for the whole
    /// sequence.
    ///
    /// Refused before anything moves if the timing is invalid or a phase is still running. Once
    /// excitation is armed the sequence always runs to the end of the acquisition; host link
    /// failures are reported afterwards.
    pub fn run<L: HostLink>(
        &mut self,
        command: NmrCommand,
        link: &mut L,
    ) -> Result<SequenceReport, SequenceError> {
        if !self.run_state.pulse_ended() {
            let busy = ArmError::Busy {
                phase: self.run_state.phase(),
                trigger_count: self.run_state.trigger_count(),
                length_pulse: self.run_state.length_pulse(),
            };
            warn!("Sequence refused: {}", busy);
            return Err(busy.into());
        }
        let (excitation, acquisition) = self.plan(command)?;
        debug!(
            "Excitation: {} ticks at {} Hz; acquisition: {} samples at {} Hz",
            excitation.total_ticks,
            excitation.tick_rate_hz,
            acquisition.total_ticks,
            acquisition.tick_rate_hz
        );

        let mut link = LinkHealth::new(link);
        let result = self.run_phases(&excitation, &acquisition, &mut link);
        self.enter(SequenceState::Idle);

        match result {
            Ok(_) if link.failed => {
                error!("Host link failed during the sequence");
                Err(SequenceError::Link)
            }
            Ok(report) => Ok(report),
            Err(err) => {
                error!("Sequence aborted: {}", err);
                if let Err(relay_err) = self.relays.safe() {
                    error!("Unable to return relays to the safe state: {}", relay_err);
                }
                Err(err)
            }
        }
    }

    /// Polarizing through Finalizing
    fn run_phases<L: HostLink>(
        &mut self,
        excitation: &TriggerConfig,
        acquisition: &TriggerConfig,
        link: &mut LinkHealth<'_, L>,
    ) -> Result<SequenceReport, SequenceError> {
        self.enter(SequenceState::Polarizing);
        link.status(format_args!(
            "STATUS: Polarizing coil ON for {} ms...",
            self.config.polarize_ms
        ));
        self.relays.polarize(true)?;
        self.delay.delay_ms(self.config.polarize_ms);
        self.relays.polarize(false)?;
        link.status(format_args!("STATUS: Polarization complete."));

        self.enter(SequenceState::ArmingExcitation);
        link.status(format_args!("STATUS: Setting relay to WRITE mode..."));
        self.relays.select(RelayMode::Write)?;
        self.delay.delay_ms(self.config.relay_settle_ms);
        link.status(format_args!(
            "STATUS: Starting excitation pulse at {} Hz...",
            self.config.carrier_hz
        ));
        self.run_state.arm(excitation, &mut self.trigger)?;

        self.enter(SequenceState::Exciting);
        self.wait_for_phase_end();
        let excitation_ticks = self.run_state.trigger_count();
        link.status(format_args!("STATUS: Pulse finished."));

        self.enter(SequenceState::ArmingAcquisition);
        link.status(format_args!("STATUS: Setting relay to READ mode..."));
        self.relays.select(RelayMode::Read)?;
        self.delay.delay_ms(self.config.relay_settle_ms);
        link.status(format_args!(
            "STATUS: Starting data read at {} SPS...",
            self.config.sample_rate_hz
        ));
        self.ring.discard_pending();
        self.ring.take_peak_fill();
        let dropped_before = self.ring.dropped();
        self.run_state.arm(acquisition, &mut self.trigger)?;

        self.enter(SequenceState::Reading);
        let samples_streamed = self.stream_acquisition(link);

        self.enter(SequenceState::Finalizing);
        let report = SequenceReport {
            excitation_ticks,
            samples_streamed,
            samples_dropped: self.ring.dropped().wrapping_sub(dropped_before),
            peak_fill: self.ring.take_peak_fill(),
        };
        if report.samples_dropped > 0 {
            warn!(
                "{} samples dropped, ring peaked at {}/{}",
                report.samples_dropped, report.peak_fill, N
            );
            link.status(format_args!(
                "WARNING: {} samples dropped (ring peaked at {}/{}).",
                report.samples_dropped, report.peak_fill, N
            ));
        }
        link.status(format_args!("STATUS: Data read complete. Sequence finished."));
        info!(
            "Sequence finished: {} samples streamed, {} dropped",
            report.samples_streamed, report.samples_dropped
        );

        if self.config.fail_on_overrun && report.samples_dropped > 0 {
            return Err(SequenceError::Overrun {
                dropped: report.samples_dropped,
            });
        }
        Ok(report)
    }

    /// Stream samples between the two sentinels until the acquisition ends and the ring is
    /// empty. Returns the number of samples drained.
    fn stream_acquisition<L: HostLink>(&mut self, link: &mut LinkHealth<'_, L>) -> u32 {
        let mut stream = link.begin_stream();
        let mut drained = 0u32;
        loop {
            // Sampled before draining: once seen, every sample of the phase is already queued
            let finished = self.run_state.pulse_ended();
            for sample in self.ring.drain() {
                #[cfg(feature = "trace_samples")]
                trace!("sample {}: {}", drained, sample);
                if let Some(writer) = stream.as_mut() {
                    if writer.push(sample).is_err() {
                        stream = None;
                    }
                }
                drained += 1;
            }
            if finished {
                break;
            }
            core::hint::spin_loop();
        }

        match stream {
            Some(writer) => {
                if writer.end().is_err() {
                    link.failed = true;
                }
            }
            None => link.failed = true,
        }
        drained
    }

    /// Spin until the tick handler reports the end of the running phase
    fn wait_for_phase_end(&self) {
        while !self.run_state.pulse_ended() {
            core::hint::spin_loop();
        }
    }

    /// Record and log a state transition
    fn enter(&mut self, next: SequenceState) {
        if self.state != next {
            info!("Sequence: {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

/// Host link wrapper that remembers the first failure instead of aborting the sequence
struct LinkHealth<'l, L> {
    /// Wrapped link
    link: &'l mut L,
    /// A write has failed
    failed: bool,
}

impl<'l, L: HostLink> LinkHealth<'l, L> {
    /// Wrap `link`
    fn new(link: &'l mut L) -> Self {
        Self {
            link,
            failed: false,
        }
    }

    /// Best-effort status line
    fn status(&mut self, args: core::fmt::Arguments<'_>) {
        if !self.failed && self.link.status(args).is_err() {
            self.failed = true;
        }
    }

    /// Open a sample stream, `None` if the link has failed
    fn begin_stream(&mut self) -> Option<SampleStream<'_, L>> {
        if self.failed {
            return None;
        }
        match SampleStream::begin(&mut *self.link) {
            Ok(stream) => Some(stream),
            Err(_) => {
                self.failed = true;
                None
            }
        }
    }
}
