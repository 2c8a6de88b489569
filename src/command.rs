//! Host command line: `NMR(<pulse_ms>,<read_ms>)`.
use core::{fmt, str::FromStr};

use thiserror::Error;

/// Longest accepted command line, terminator excluded
pub const LINE_LEN: usize = 64;

/// One NMR sequence request
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NmrCommand {
    /// Excitation pulse length
    pub pulse_ms: u32,
    /// Acquisition length
    pub read_ms: u32,
}

/// Which argument of the command was bad
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Argument {
    /// First argument
    PulseMs,
    /// Second argument
    ReadMs,
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PulseMs => "pulse_ms",
            Self::ReadMs => "read_ms",
        })
    }
}

/// Why a line was not accepted
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandError {
    /// The line does not start with `NMR(`
    #[error("unknown command")]
    UnknownCommand,
    /// The closing parenthesis is missing, or followed by more text
    #[error("expected `)` at the end of the command")]
    Unterminated,
    /// Other than two comma-separated arguments
    #[error("expected two arguments")]
    ArgumentCount,
    /// An argument is not a non-negative decimal integer that fits in 32 bits
    #[error("{0} must be a non-negative integer")]
    BadArgument(Argument),
    /// The line did not fit the line buffer
    #[error("line longer than {} characters", LINE_LEN)]
    LineTooLong,
}

impl CommandError {
    /// Diagnostic line sent back to the host
    pub const USAGE: &'static str = "Use: NMR(pulse_ms,read_ms)";
}

impl NmrCommand {
    /// Parse a command line without its terminator
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let args = line
            .trim()
            .strip_prefix("NMR(")
            .ok_or(CommandError::UnknownCommand)?
            .strip_suffix(')')
            .ok_or(CommandError::Unterminated)?;

        let mut args = args.split(',');
        let (Some(pulse_ms), Some(read_ms), None) = (args.next(), args.next(), args.next()) else {
            return Err(CommandError::ArgumentCount);
        };

        Ok(Self {
            pulse_ms: parse_ms(pulse_ms, Argument::PulseMs)?,
            read_ms: parse_ms(read_ms, Argument::ReadMs)?,
        })
    }
}

impl FromStr for NmrCommand {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Plain decimal only: no sign, no radix prefix
fn parse_ms(arg: &str, which: Argument) -> Result<u32, CommandError> {
    let arg = arg.trim();
    if arg.is_empty() || !arg.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CommandError::BadArgument(which));
    }
    arg.parse().map_err(|_| CommandError::BadArgument(which))
}

/// Assembles bytes from the host into command lines.
#[derive(Debug, Default)]
pub struct LineReader {
    /// Current line
    line: heapless::Vec<u8, LINE_LEN>,
    /// The current line overflowed; discard until the next terminator
    overflowed: bool,
}

impl LineReader {
    /// Empty reader
    pub const fn new() -> Self {
        Self {
            line: heapless::Vec::new(),
            overflowed: false,
        }
    }

    /// Consume one byte. Returns a parse result whenever `\r` or `\n` ends a non-empty line.
    pub fn push(&mut self, byte: u8) -> Option<Result<NmrCommand, CommandError>> {
        match byte {
            b'\r' | b'\n' => {
                let result = if self.overflowed {
                    Some(Err(CommandError::LineTooLong))
                } else if self.line.is_empty() {
                    None
                } else {
                    Some(
                        core::str::from_utf8(&self.line)
                            .map_err(|_| CommandError::UnknownCommand)
                            .and_then(NmrCommand::parse),
                    )
                };
                self.line.clear();
                self.overflowed = false;
                result
            }
            _ if self.overflowed => None,
            _ => {
                if self.line.push(byte).is_err() {
                    self.overflowed = true;
                }
                None
            }
        }
    }
}
