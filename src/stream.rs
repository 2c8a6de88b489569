//! Host link and the binary sample stream carried on it.
//!
//! Wire format: `0xFFFF`, then every sample as a little-endian `u16`, then `0xFFFF`. Samples are
//! 12-bit so they can never collide with the sentinel. Status text shares the link and is only
//! sent outside of a stream.
use core::fmt::{self, Write as _};

use crate::buffer::{Sample, ADC_MAX};

/// Marks both ends of an acquisition stream
pub const SENTINEL: u16 = 0xFFFF;

/// Byte link to the host (USB CDC on the board).
pub trait HostLink {
    /// Transport failure
    type Error: fmt::Debug;

    /// Send every byte of `bytes`, blocking until done
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Send one line of status text. The line is written as it is formatted, whatever its length.
    fn status(&mut self, args: fmt::Arguments<'_>) -> Result<(), Self::Error> {
        let mut writer = LinkWriter {
            link: &mut *self,
            error: None,
        };
        if writer.write_fmt(args).is_err() {
            // A failing `Display` impl still gets its line terminated
            if let Some(err) = writer.error {
                return Err(err);
            }
        }
        self.write_all(b"\n")
    }
}

/// [`fmt::Write`] straight into a [`HostLink`], keeping the first link error
struct LinkWriter<'a, L: HostLink + ?Sized> {
    /// Destination
    link: &'a mut L,
    /// Why the last write failed
    error: Option<L::Error>,
}

impl<L: HostLink + ?Sized> fmt::Write for LinkWriter<'_, L> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.link.write_all(s.as_bytes()).map_err(|err| {
            self.error = Some(err);
            fmt::Error
        })
    }
}

impl<L: HostLink + ?Sized> HostLink for &mut L {
    type Error = L::Error;

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        (**self).write_all(bytes)
    }

    fn status(&mut self, args: fmt::Arguments<'_>) -> Result<(), Self::Error> {
        (**self).status(args)
    }
}

/// Writer for one acquisition stream
pub struct SampleStream<'l, L> {
    /// Destination link
    link: &'l mut L,
    /// Samples written since [`begin`](Self::begin)
    written: u32,
}

impl<'l, L: HostLink> SampleStream<'l, L> {
    /// Send the start sentinel
    pub fn begin(link: &'l mut L) -> Result<Self, L::Error> {
        link.write_all(&SENTINEL.to_le_bytes())?;
        Ok(Self { link, written: 0 })
    }

    /// Send one sample, masked to 12 bits
    #[inline]
    pub fn push(&mut self, sample: Sample) -> Result<(), L::Error> {
        self.link.write_all(&(sample & ADC_MAX).to_le_bytes())?;
        self.written += 1;
        Ok(())
    }

    /// Send the end sentinel and return the sample count
    pub fn end(self) -> Result<u32, L::Error> {
        self.link.write_all(&SENTINEL.to_le_bytes())?;
        Ok(self.written)
    }
}

/// Something recognised by [`StreamDecoder`]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StreamEvent {
    /// Start sentinel
    Start,
    /// One sample, masked to 12 bits
    Sample(Sample),
    /// End sentinel
    End,
}

/// Host-side decoder for the sample stream.
///
/// Status text before the stream is skipped byte by byte, so it does not have to end on a word
/// boundary.
#[derive(Debug, Default, Clone)]
pub struct StreamDecoder {
    /// Previous byte while searching, low byte of a half-received word while streaming
    low: Option<u8>,
    /// Between a start and an end sentinel
    in_stream: bool,
}

impl StreamDecoder {
    /// Decoder waiting for a start sentinel
    pub const fn new() -> Self {
        Self {
            low: None,
            in_stream: false,
        }
    }

    /// `true` between the two sentinels
    pub fn in_stream(&self) -> bool {
        self.in_stream
    }

    /// Consume one byte
    pub fn feed(&mut self, byte: u8) -> Option<StreamEvent> {
        if !self.in_stream {
            if self.low == Some(0xFF) && byte == 0xFF {
                self.low = None;
                self.in_stream = true;
                return Some(StreamEvent::Start);
            }
            self.low = Some(byte);
            return None;
        }

        let Some(low) = self.low.take() else {
            self.low = Some(byte);
            return None;
        };
        match u16::from_le_bytes([low, byte]) {
            SENTINEL => {
                self.in_stream = false;
                Some(StreamEvent::End)
            }
            sample => Some(StreamEvent::Sample(sample & ADC_MAX)),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{string::String, vec::Vec};

    use super::*;

    /// Link capturing everything in memory
    #[derive(Default)]
    pub(crate) struct MemoryLink {
        pub(crate) bytes: Vec<u8>,
    }

    impl MemoryLink {
        /// Everything written, decoded as text up to the first stream
        pub(crate) fn text(&self) -> String {
            let end = self
                .bytes
                .windows(2)
                .position(|w| w == [0xFF, 0xFF])
                .unwrap_or(self.bytes.len());
            String::from_utf8_lossy(&self.bytes[..end]).into_owned()
        }
    }

    impl HostLink for MemoryLink {
        type Error = core::convert::Infallible;

        fn write_all(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
            self.bytes.extend_from_slice(bytes);
            Ok(())
        }
    }

    #[test]
    fn stream_is_bracketed_little_endian() {
        let mut link = MemoryLink::default();
        let mut stream = SampleStream::begin(&mut link).unwrap();
        stream.push(0x0123).unwrap();
        stream.push(0x0FFF).unwrap();
        assert_eq!(stream.end().unwrap(), 2);

        assert_eq!(
            link.bytes,
            [0xFF, 0xFF, 0x23, 0x01, 0xFF, 0x0F, 0xFF, 0xFF]
        );
    }

    #[test]
    fn samples_never_look_like_a_sentinel() {
        let mut link = MemoryLink::default();
        let mut stream = SampleStream::begin(&mut link).unwrap();
        stream.push(0xFFFF).unwrap();
        stream.end().unwrap();
        assert_eq!(&link.bytes[2..4], [0xFF, 0x0F]);
    }

    #[test]
    fn decoder_skips_noise_and_splits_events() {
        let mut link = MemoryLink::default();
        link.status(format_args!("STATUS: go")).unwrap();
        let mut stream = SampleStream::begin(&mut link).unwrap();
        for sample in [5, 4095, 0] {
            stream.push(sample).unwrap();
        }
        stream.end().unwrap();

        let mut decoder = StreamDecoder::new();
        let events: Vec<StreamEvent> = link
            .bytes
            .iter()
            .filter_map(|&byte| decoder.feed(byte))
            .collect();
        assert_eq!(
            events,
            [
                StreamEvent::Start,
                StreamEvent::Sample(5),
                StreamEvent::Sample(4095),
                StreamEvent::Sample(0),
                StreamEvent::End,
            ]
        );
        assert!(!decoder.in_stream());
    }

    #[test]
    fn long_status_lines_arrive_whole() {
        let mut link = MemoryLink::default();
        let long = "x".repeat(300);
        link.status(format_args!("STATUS: {}", long)).unwrap();
        assert_eq!(link.text(), format!("STATUS: {long}\n"));

        link.bytes.clear();
        link.status(format_args!("STATUS: Pulse finished.")).unwrap();
        assert_eq!(link.text(), "STATUS: Pulse finished.\n");
    }

    /// Link that accepts `budget` writes and then fails
    struct Budget(usize);

    impl HostLink for Budget {
        type Error = ();

        fn write_all(&mut self, _: &[u8]) -> Result<(), Self::Error> {
            self.0 = self.0.checked_sub(1).ok_or(())?;
            Ok(())
        }
    }

    #[test]
    fn status_reports_a_link_failure_mid_line() {
        let mut link = Budget(1);
        assert_eq!(link.status(format_args!("ERROR: {} {}", 1, 2)), Err(()));

        // Formatting finished, the newline is the write that fails
        let mut link = Budget(1);
        assert_eq!(link.status(format_args!("STATUS: ready")), Err(()));
    }
}
