//! Data scrambler
//!
//! Frame contents (data and CRC, never primitives) are XORed with the output
//! of a 16-bit LFSR, G(x) = x^16 + x^15 + x^13 + x^4 + 1, which produces one
//! 32-bit mask per dword. Both ends seed the register with 0xFFFF at SOF, so
//! running the same number of steps on each side yields the same masks.

/// Feedback taps below x^16
pub const SCRAMBLER_POLY: u16 = 0xA011;

/// LFSR value at the start of every frame
pub const SCRAMBLER_SEED: u16 = 0xFFFF;

/// Frame scrambler
#[derive(Debug, Clone)]
pub struct Scrambler {
    lfsr: u16,
    seed: u16,
}

impl Scrambler {
    /// A scrambler seeded with [`SCRAMBLER_SEED`], or with zero when
    /// `enabled` is false (the register then never leaves zero and every
    /// mask is zero)
    pub const fn new(enabled: bool) -> Self {
        let seed = if enabled { SCRAMBLER_SEED } else { 0 };
        Self { lfsr: seed, seed }
    }

    /// A scrambler starting from an arbitrary seed
    pub const fn with_seed(seed: u16) -> Self {
        Self { lfsr: seed, seed }
    }

    /// Whether masks can be non-zero
    pub fn is_enabled(&self) -> bool {
        self.seed != 0
    }

    /// Reload the seed
    pub fn reset(&mut self) {
        self.lfsr = self.seed;
    }

    /// Produce the next 32-bit mask and step the LFSR 32 times
    pub fn mask(&mut self) -> u32 {
        let mut lfsr = self.lfsr;
        let mut mask = 0u32;
        for bit in 0..32 {
            let out = (lfsr >> 15) & 1;
            mask |= (out as u32) << bit;
            lfsr <<= 1;
            if out != 0 {
                lfsr ^= SCRAMBLER_POLY;
            }
        }
        self.lfsr = lfsr;
        mask
    }

    /// Scramble (or descramble) one dword; on the last dword of a frame the
    /// register is reloaded so the next frame starts from the seed
    pub fn apply(&mut self, word: u32, last: bool) -> u32 {
        let out = word ^ self.mask();
        if last {
            self.reset_on_last();
        }
        out
    }

    /// End-of-frame reload
    pub fn reset_on_last(&mut self) {
        self.reset();
    }
}
