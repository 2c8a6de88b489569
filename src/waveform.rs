//! Excitation waveform tables.
//!
//! The excitation pulse is a 16-step sine rendered through an 8-bit resistor-ladder DAC whose bits
//! are scattered across the GPIO bank. [`DacLut`] maps an amplitude straight to the GPIO pattern
//! so the tick handler only does two table lookups and one masked write.

/// Number of ticks used to render one cycle of the excitation waveform.
pub const TICKS_PER_CYCLE: u32 = SINE_LUT_16.len() as u32;

/// One sine cycle at 8-bit resolution, centred on 128.
pub const SINE_LUT_16: [u8; 16] = [
    128, 177, 217, 244, 255, 244, 217, 177, 128, 79, 39, 12, 1, 12, 39, 79,
];

/// GPIO assignment of the DAC bits. Index 0 is the least significant amplitude bit.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DacPinMap {
    /// GPIO number of each amplitude bit
    pins: [u8; 8],
}

impl DacPinMap {
    /// Pin assignment of the NMR driver board: `B0..B7 = GPIO 29, 6, 7, 0, 1, 2, 4, 3`.
    pub const NMR_BOARD: Self = Self::new([29, 6, 7, 0, 1, 2, 4, 3]);

    /// Create a pin map, checking that every pin exists in a 32-bit GPIO bank and that no pin is
    /// used twice.
    ///
    /// Panics otherwise, which is a compile error when used in a `const`.
    pub const fn new(pins: [u8; 8]) -> Self {
        let mut i = 0;
        while i < pins.len() {
            assert!(pins[i] < 32, "DAC pin outside of the GPIO bank");
            let mut j = i + 1;
            while j < pins.len() {
                assert!(pins[i] != pins[j], "DAC pin assigned twice");
                j += 1;
            }
            i += 1;
        }
        Self { pins }
    }

    /// Mask covering every DAC pin
    pub const fn mask(&self) -> u32 {
        let mut mask = 0;
        let mut bit = 0;
        while bit < self.pins.len() {
            mask |= 1 << self.pins[bit];
            bit += 1;
        }
        mask
    }

    /// Scatter an amplitude onto the GPIO bank
    pub const fn encode(&self, amplitude: u8) -> u32 {
        let mut pattern = 0;
        let mut bit = 0;
        while bit < self.pins.len() {
            pattern |= (((amplitude >> bit) & 1) as u32) << self.pins[bit];
            bit += 1;
        }
        pattern
    }

    /// Gather an amplitude back from a GPIO pattern. Bits outside of [`mask`](Self::mask) are
    /// ignored.
    pub const fn decode(&self, pattern: u32) -> u8 {
        let mut amplitude = 0;
        let mut bit = 0;
        while bit < self.pins.len() {
            amplitude |= (((pattern >> self.pins[bit]) & 1) as u8) << bit;
            bit += 1;
        }
        amplitude
    }
}

/// Precomputed amplitude to GPIO pattern table.
#[derive(Debug, Clone)]
pub struct DacLut {
    /// Pin map the table was built from
    map: DacPinMap,
    /// `table[amplitude]` is the GPIO pattern for `amplitude`
    table: [u32; 256],
}

impl DacLut {
    /// Build the table for `map`
    pub const fn new(map: DacPinMap) -> Self {
        let mut table = [0u32; 256];
        let mut amplitude = 0;
        while amplitude < table.len() {
            table[amplitude] = map.encode(amplitude as u8);
            amplitude += 1;
        }
        Self { map, table }
    }

    /// Pin map the table was built from
    pub const fn pin_map(&self) -> &DacPinMap {
        &self.map
    }

    /// Mask to use with every write of a pattern from this table
    pub const fn mask(&self) -> u32 {
        self.map.mask()
    }

    /// GPIO pattern for `amplitude`
    #[inline]
    pub fn pattern(&self, amplitude: u8) -> u32 {
        self.table[amplitude as usize]
    }

    /// GPIO pattern for the sine step played on excitation tick `tick`
    #[inline]
    pub fn sine_pattern(&self, tick: u32) -> u32 {
        self.pattern(SINE_LUT_16[(tick % TICKS_PER_CYCLE) as usize])
    }
}

/// Table for the NMR driver board
pub static NMR_BOARD_LUT: DacLut = DacLut::new(DacPinMap::NMR_BOARD);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_mask_covers_eight_pins() {
        let mask = DacPinMap::NMR_BOARD.mask();
        assert_eq!(mask.count_ones(), 8);
        assert_eq!(
            mask,
            (1 << 29) | (1 << 6) | (1 << 7) | (1 << 0) | (1 << 1) | (1 << 2) | (1 << 4) | (1 << 3)
        );
    }

    #[test]
    fn every_amplitude_survives_the_pin_permutation() {
        let map = NMR_BOARD_LUT.pin_map();
        for amplitude in 0..=u8::MAX {
            let pattern = NMR_BOARD_LUT.pattern(amplitude);
            assert_eq!(pattern & !NMR_BOARD_LUT.mask(), 0);
            assert_eq!(map.decode(pattern), amplitude);
        }
    }

    #[test]
    fn top_bit_lands_on_gpio3() {
        assert_eq!(NMR_BOARD_LUT.pattern(0x80), 1 << 3);
        assert_eq!(NMR_BOARD_LUT.pattern(0x01), 1 << 29);
    }

    #[test]
    fn sine_repeats_every_cycle() {
        for tick in 0..TICKS_PER_CYCLE {
            assert_eq!(
                NMR_BOARD_LUT.sine_pattern(tick),
                NMR_BOARD_LUT.sine_pattern(tick + 5 * TICKS_PER_CYCLE)
            );
        }
        assert_eq!(
            NMR_BOARD_LUT.pin_map().decode(NMR_BOARD_LUT.sine_pattern(4)),
            255
        );
    }

    #[test]
    #[should_panic(expected = "DAC pin assigned twice")]
    fn duplicate_pins_are_rejected() {
        DacPinMap::new([0, 1, 2, 3, 4, 5, 6, 0]);
    }
}
