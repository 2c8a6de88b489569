//! Host console: turns incoming bytes into sequences and reports on them.
use embedded_hal::{delay::DelayNs, digital::OutputPin};

use crate::{
    command::{CommandError, LineReader, NmrCommand},
    components::TriggerSource,
    log::{info, warn},
    sequence::{SequenceController, SequenceError, SequenceReport},
    stream::HostLink,
};

/// Prompt sent at startup and after every sequence
pub const READY: &str = "NMR Controller Ready. Waiting for commands...";

/// What one complete line led to
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConsoleEvent {
    /// The line was not a valid command. The host was told; nothing ran.
    Rejected(CommandError),
    /// A sequence was run for `command`
    Ran {
        /// Accepted command
        command: NmrCommand,
        /// Sequence outcome
        outcome: Result<SequenceReport, SequenceError>,
    },
}

/// Line-oriented command console on top of a [`HostLink`]
#[derive(Debug, Default)]
pub struct Console {
    /// Partial command line
    reader: LineReader,
}

impl Console {
    /// Console with an empty line buffer
    pub const fn new() -> Self {
        Self {
            reader: LineReader::new(),
        }
    }

    /// Announce that commands are accepted
    pub fn greet<L: HostLink>(&self, link: &mut L) -> Result<(), L::Error> {
        link.status(format_args!("{}", READY))
    }

    /// Consume bytes from the host, running a sequence for every complete valid command. Blocks
    /// for as long as the sequences take.
    ///
    /// `on_event` sees the outcome of every complete line. Host link errors while reporting are
    /// returned; bytes after the failing line are not consumed.
    pub fn feed<L, P, RW, T, D, const N: usize>(
        &mut self,
        bytes: &[u8],
        controller: &mut SequenceController<'_, P, RW, T, D, N>,
        link: &mut L,
        mut on_event: impl FnMut(ConsoleEvent),
    ) -> Result<(), L::Error>
    where
        L: HostLink,
        P: OutputPin,
        RW: OutputPin,
        T: TriggerSource,
        D: DelayNs,
    {
        for &byte in bytes {
            let Some(line) = self.reader.push(byte) else {
                continue;
            };
            let event = match line {
                Ok(command) => Self::execute(command, controller, link)?,
                Err(err) => {
                    warn!("Rejected command line: {}", err);
                    link.status(format_args!(
                        "ERROR: Invalid command format: {}. {}",
                        err,
                        CommandError::USAGE
                    ))?;
                    ConsoleEvent::Rejected(err)
                }
            };
            on_event(event);
        }
        Ok(())
    }

    /// Run one accepted command and report it
    fn execute<L, P, RW, T, D, const N: usize>(
        command: NmrCommand,
        controller: &mut SequenceController<'_, P, RW, T, D, N>,
        link: &mut L,
    ) -> Result<ConsoleEvent, L::Error>
    where
        L: HostLink,
        P: OutputPin,
        RW: OutputPin,
        T: TriggerSource,
        D: DelayNs,
    {
        info!(
            "Command: pulse {} ms, read {} ms",
            command.pulse_ms, command.read_ms
        );
        link.status(format_args!(
            "COMMAND RECEIVED: Pulse={}ms, Read={}ms",
            command.pulse_ms, command.read_ms
        ))?;

        let outcome = controller.run(command, &mut *link);
        match &outcome {
            Ok(_) => {}
            // The link already failed, telling the host would fail too
            Err(SequenceError::Link) => {}
            Err(err) => link.status(format_args!("ERROR: {}", err))?,
        }
        link.status(format_args!("{}", READY))?;
        Ok(ConsoleEvent::Ran { command, outcome })
    }
}
