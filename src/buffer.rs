// SPDX-License-Identifier: Apache-2.0

//! Sample ring between the tick handler (producer) and the sequence controller (consumer).
//!
//! Both indices are free-running `u32` counters and only ever see atomic loads and stores, which
//! the Cortex-M0+ supports without RMW instructions. Each index has exactly one writer:
//!
//! | field         | writer   |
//! |---------------|----------|
//! | `write_index` | producer |
//! | `dropped`     | producer |
//! | `read_index`  | consumer |
//! | `peak_fill`   | consumer |
use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use thiserror::Error;

/// One ADC reading. 12 significant bits, zero-extended.
pub type Sample = u16;

/// Largest value a 12-bit ADC can produce
pub const ADC_MAX: Sample = 0x0FFF;

/// The producer found the ring full. The sample was discarded, nothing was overwritten.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[error("sample ring full, sample dropped")]
pub struct Overrun;

/// Fixed-capacity single-producer/single-consumer queue of [`Sample`]s.
///
/// `N` must be a power of two so slot lookup is a mask and the free-running counters wrap
/// cleanly.
pub struct SampleRing<const N: usize> {
    /// Sample storage, indexed by `index & (N - 1)`
    slots: [AtomicU16; N],
    /// Total samples ever pushed
    write_index: AtomicU32,
    /// Total samples ever popped or discarded
    read_index: AtomicU32,
    /// Samples discarded because the ring was full
    dropped: AtomicU32,
    /// Highest occupancy observed by the consumer
    peak_fill: AtomicU32,
}

impl<const N: usize> SampleRing<N> {
    /// Evaluated once per capacity, so a bad `N` fails the build.
    const VALID_CAPACITY: () = assert!(
        N.is_power_of_two() && N <= (1 << 31),
        "SampleRing capacity must be a power of two no larger than 2^31"
    );
    /// Slot index mask
    const MASK: u32 = (N - 1) as u32;

    /// Create an empty ring. Usable in a `static`.
    #[allow(clippy::let_unit_value)]
    pub const fn new() -> Self {
        let () = Self::VALID_CAPACITY;
        Self {
            slots: [const { AtomicU16::new(0) }; N],
            write_index: AtomicU32::new(0),
            read_index: AtomicU32::new(0),
            dropped: AtomicU32::new(0),
            peak_fill: AtomicU32::new(0),
        }
    }

    /// Number of samples the ring can hold
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Queue a sample. Producer side only.
    ///
    /// If the consumer has fallen a full ring behind, the sample is discarded and counted in
    /// [`dropped`](Self::dropped) instead of overwriting unread data.
    #[inline]
    pub fn push(&self, sample: Sample) -> Result<(), Overrun> {
        let write = self.write_index.load(Ordering::Relaxed);
        let read = self.read_index.load(Ordering::Acquire);
        if write.wrapping_sub(read) as usize >= N {
            let dropped = self.dropped.load(Ordering::Relaxed);
            self.dropped
                .store(dropped.saturating_add(1), Ordering::Relaxed);
            return Err(Overrun);
        }

        self.slots[(write & Self::MASK) as usize].store(sample, Ordering::Relaxed);
        self.write_index
            .store(write.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Take the oldest sample if there is one. Consumer side only, never blocks.
    #[inline]
    pub fn pop(&self) -> Option<Sample> {
        let read = self.read_index.load(Ordering::Relaxed);
        let write = self.write_index.load(Ordering::Acquire);
        if read == write {
            return None;
        }

        let fill = write.wrapping_sub(read);
        if fill > self.peak_fill.load(Ordering::Relaxed) {
            self.peak_fill.store(fill, Ordering::Relaxed);
        }

        let sample = self.slots[(read & Self::MASK) as usize].load(Ordering::Relaxed);
        self.read_index
            .store(read.wrapping_add(1), Ordering::Release);
        Some(sample)
    }

    /// Pop until the ring is momentarily empty
    pub fn drain(&self) -> Drain<'_, N> {
        Drain { ring: self }
    }

    /// Forget everything currently queued. Consumer side only.
    pub fn discard_pending(&self) {
        let write = self.write_index.load(Ordering::Acquire);
        self.read_index.store(write, Ordering::Release);
    }

    /// Samples currently queued
    pub fn len(&self) -> usize {
        let write = self.write_index.load(Ordering::Acquire);
        let read = self.read_index.load(Ordering::Acquire);
        write.wrapping_sub(read) as usize
    }

    /// `true` when the read and write indices meet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Samples discarded since the ring was created. Monotonic, saturates at [`u32::MAX`].
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Highest occupancy seen by [`pop`](Self::pop) since the last call to
    /// [`take_peak_fill`](Self::take_peak_fill)
    pub fn peak_fill(&self) -> u32 {
        self.peak_fill.load(Ordering::Relaxed)
    }

    /// Return [`peak_fill`](Self::peak_fill) and reset it. Consumer side only.
    pub fn take_peak_fill(&self) -> u32 {
        let peak = self.peak_fill.load(Ordering::Relaxed);
        self.peak_fill.store(0, Ordering::Relaxed);
        peak
    }
}

impl<const N: usize> Default for SampleRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator returned by [`SampleRing::drain`]
pub struct Drain<'a, const N: usize> {
    /// Ring being drained
    ring: &'a SampleRing<N>,
}

impl<const N: usize> Iterator for Drain<'_, N> {
    type Item = Sample;

    fn next(&mut self) -> Option<Self::Item> {
        self.ring.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_until_pushed() {
        let ring = SampleRing::<4>::new();
        assert!(ring.is_empty());
        assert_eq!(ring.pop(), None);

        ring.push(7).unwrap();
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.pop(), Some(7));
        assert_eq!(ring.pop(), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn interleaved_fifo_across_wraparound() {
        let ring = SampleRing::<8>::new();
        let mut next_in = 0u16;
        let mut next_out = 0u16;

        // Uneven push/pop bursts walk the indices around the ring many times
        for round in 0..200 {
            for _ in 0..(round % 7 + 1) {
                if ring.len() < ring.capacity() {
                    ring.push(next_in).unwrap();
                    next_in += 1;
                }
            }
            for _ in 0..(round % 5 + 1) {
                match ring.pop() {
                    Some(sample) => {
                        assert_eq!(sample, next_out);
                        next_out += 1;
                    }
                    None => assert_eq!(next_in, next_out),
                }
            }
        }

        assert_eq!(ring.drain().count() as u16, next_in - next_out);
        assert_eq!(ring.dropped(), 0);
    }

    #[test]
    fn overrun_drops_new_samples_and_keeps_old_ones() {
        let ring = SampleRing::<4>::new();
        for sample in 0..4 {
            ring.push(sample).unwrap();
        }
        assert_eq!(ring.push(100), Err(Overrun));
        assert_eq!(ring.push(101), Err(Overrun));
        assert_eq!(ring.dropped(), 2);

        let drained: std::vec::Vec<Sample> = ring.drain().collect();
        assert_eq!(drained, [0, 1, 2, 3]);
        assert_eq!(ring.take_peak_fill(), 4);
        assert_eq!(ring.peak_fill(), 0);

        ring.push(4).unwrap();
        assert_eq!(ring.pop(), Some(4));
    }

    #[test]
    fn discard_pending_empties_the_ring() {
        let ring = SampleRing::<16>::new();
        for sample in 0..10 {
            ring.push(sample).unwrap();
        }
        ring.discard_pending();
        assert!(ring.is_empty());
        assert_eq!(ring.pop(), None);
        ring.push(42).unwrap();
        assert_eq!(ring.pop(), Some(42));
    }

    #[test]
    fn producer_thread_against_consumer_thread() {
        static RING: SampleRing<64> = SampleRing::new();
        const TOTAL: u16 = 20_000;

        let producer = std::thread::spawn(|| {
            let mut sample = 0;
            while sample < TOTAL {
                if RING.push(sample).is_ok() {
                    sample += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });

        let mut expected = 0;
        while expected < TOTAL {
            match RING.pop() {
                Some(sample) => {
                    assert_eq!(sample, expected);
                    expected += 1;
                }
                None => std::thread::yield_now(),
            }
        }
        producer.join().unwrap();
        assert!(RING.is_empty());
    }
}
