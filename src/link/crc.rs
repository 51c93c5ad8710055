//! Frame CRC
//!
//! SATA protects every frame with a 32-bit CRC over the (unscrambled) data
//! dwords. The generator is the usual 0x04C11DB7, processed MSB first one
//! whole dword at a time, starting from a fixed non-zero seed and with no
//! final inversion.

/// Generator polynomial
pub const CRC_POLY: u32 = 0x04C1_1DB7;

/// Accumulator value at the start of every frame
pub const CRC_INIT: u32 = 0x5232_5032;

/// Running frame CRC
#[derive(Debug, Clone)]
pub struct Crc {
    value: u32,
}

impl Crc {
    /// A fresh accumulator seeded with [`CRC_INIT`]
    pub const fn new() -> Self {
        Self { value: CRC_INIT }
    }

    /// Restart for a new frame
    pub fn reset(&mut self) {
        self.value = CRC_INIT;
    }

    /// Fold one data dword into the accumulator and return the new value
    pub fn advance(&mut self, word: u32) -> u32 {
        let mut crc = self.value;
        for bit in (0..32).rev() {
            let feedback = ((crc >> 31) ^ (word >> bit)) & 1;
            crc <<= 1;
            if feedback != 0 {
                crc ^= CRC_POLY;
            }
        }
        self.value = crc;
        crc
    }

    /// CRC of everything advanced since the last reset
    pub fn finalize(&self) -> u32 {
        self.value
    }
}

impl Default for Crc {
    fn default() -> Self {
        Self::new()
    }
}

/// CRC of a complete payload
pub fn frame_crc(words: &[u32]) -> u32 {
    let mut crc = Crc::new();
    for &w in words {
        crc.advance(w);
    }
    crc.finalize()
}
