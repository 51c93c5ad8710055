//! Frame Information Structures
//!
//! Byte-exact FIS layouts as `zerocopy` structs. A FIS travels as a sequence
//! of little-endian dwords; the type byte is the low byte of the first one.
//!
//! Reference: Serial ATA Revision 3.x, 10.5 "FIS types".

use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Largest control FIS, in dwords
pub const SHADOW_FIS_WORDS: usize = 8;

/// Payload limit of one Data FIS, in dwords (8 KiB)
pub const MAX_DATA_FIS_WORDS: usize = 2048;

/// Register FIS - Host to Device
pub const FIS_TYPE_REG_H2D: u8 = 0x27;
/// Register FIS - Device to Host
pub const FIS_TYPE_REG_D2H: u8 = 0x34;
/// DMA Activate FIS - Device to Host
pub const FIS_TYPE_DMA_ACT: u8 = 0x39;
/// DMA Setup FIS - Bidirectional
pub const FIS_TYPE_DMA_SETUP: u8 = 0x41;
/// Data FIS - Bidirectional
pub const FIS_TYPE_DATA: u8 = 0x46;
/// PIO Setup FIS - Device to Host
pub const FIS_TYPE_PIO_SETUP: u8 = 0x5F;
/// Set Device Bits FIS - Device to Host
pub const FIS_TYPE_DEV_BITS: u8 = 0xA1;

/// Why a dword sequence is not a valid FIS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FisError {
    /// Fewer dwords than the layout needs
    Truncated,
    WrongType { expected: FisType, found: u8 },
    UnknownType(u8),
}

/// FIS type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FisType {
    RegH2d,
    RegD2h,
    DmaActivate,
    DmaSetup,
    Data,
    PioSetup,
    SetDeviceBits,
}

impl FisType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            FIS_TYPE_REG_H2D => Some(FisType::RegH2d),
            FIS_TYPE_REG_D2H => Some(FisType::RegD2h),
            FIS_TYPE_DMA_ACT => Some(FisType::DmaActivate),
            FIS_TYPE_DMA_SETUP => Some(FisType::DmaSetup),
            FIS_TYPE_DATA => Some(FisType::Data),
            FIS_TYPE_PIO_SETUP => Some(FisType::PioSetup),
            FIS_TYPE_DEV_BITS => Some(FisType::SetDeviceBits),
            _ => None,
        }
    }

    /// Type of the FIS whose first dword is `dword`
    pub fn of(dword: u32) -> Option<Self> {
        Self::from_byte(dword as u8)
    }

    pub fn byte(self) -> u8 {
        match self {
            FisType::RegH2d => FIS_TYPE_REG_H2D,
            FisType::RegD2h => FIS_TYPE_REG_D2H,
            FisType::DmaActivate => FIS_TYPE_DMA_ACT,
            FisType::DmaSetup => FIS_TYPE_DMA_SETUP,
            FisType::Data => FIS_TYPE_DATA,
            FisType::PioSetup => FIS_TYPE_PIO_SETUP,
            FisType::SetDeviceBits => FIS_TYPE_DEV_BITS,
        }
    }
}

/// Fixed-layout FIS that can be converted to and from dwords
pub trait Fis: FromBytes + IntoBytes + Immutable + KnownLayout + Sized {
    const TYPE: FisType;

    /// Length in dwords
    const DWORDS: usize = core::mem::size_of::<Self>() / 4;

    fn to_dwords(&self) -> heapless::Vec<u32, SHADOW_FIS_WORDS> {
        let mut out = heapless::Vec::new();
        for chunk in self.as_bytes().chunks_exact(4) {
            let dword = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            // Every layout fits the shadow buffer
            let _ = out.push(dword);
        }
        out
    }

    fn from_dwords(dwords: &[u32]) -> Result<Self, FisError> {
        if dwords.len() < Self::DWORDS {
            return Err(FisError::Truncated);
        }
        let found = dwords[0] as u8;
        if found != Self::TYPE.byte() {
            return Err(FisError::WrongType {
                expected: Self::TYPE,
                found,
            });
        }
        let mut bytes = [0u8; SHADOW_FIS_WORDS * 4];
        for (slot, dword) in bytes.chunks_exact_mut(4).zip(dwords.iter().take(Self::DWORDS)) {
            slot.copy_from_slice(&dword.to_le_bytes());
        }
        Self::read_from_prefix(&bytes)
            .map(|(fis, _)| fis)
            .map_err(|_| FisError::Truncated)
    }
}

/// Split a 48-bit LBA into six bytes
fn lba_bytes(lba: u64) -> [u8; 6] {
    let b = lba.to_le_bytes();
    [b[0], b[1], b[2], b[3], b[4], b[5]]
}

fn lba_from(low: [u8; 3], high: [u8; 3]) -> u64 {
    u64::from_le_bytes([low[0], low[1], low[2], high[0], high[1], high[2], 0, 0])
}

/// Register FIS - Host to Device (20 bytes)
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RegH2d {
    pub fis_type: u8,
    /// PM port 3:0, C (command register update) bit 7
    pub flags: u8,
    pub command: u8,
    pub features: u8,
    pub lba0: u8,
    pub lba1: u8,
    pub lba2: u8,
    pub device: u8,
    pub lba3: u8,
    pub lba4: u8,
    pub lba5: u8,
    pub features_exp: u8,
    pub count: u8,
    pub count_exp: u8,
    pub icc: u8,
    pub control: u8,
    pub _reserved: [u8; 4],
}

impl RegH2d {
    pub const FLAG_COMMAND: u8 = 1 << 7;

    /// Command FIS with the C bit set
    pub fn command(command: u8, features: u16, lba: u64, count: u16, device: u8) -> Self {
        let lba = lba_bytes(lba);
        Self {
            fis_type: FIS_TYPE_REG_H2D,
            flags: Self::FLAG_COMMAND,
            command,
            features: features as u8,
            lba0: lba[0],
            lba1: lba[1],
            lba2: lba[2],
            device,
            lba3: lba[3],
            lba4: lba[4],
            lba5: lba[5],
            features_exp: (features >> 8) as u8,
            count: count as u8,
            count_exp: (count >> 8) as u8,
            ..Self::default()
        }
    }

    /// Device control FIS (C bit clear)
    pub fn control(control: u8) -> Self {
        Self {
            fis_type: FIS_TYPE_REG_H2D,
            control,
            ..Self::default()
        }
    }

    pub fn is_command(&self) -> bool {
        self.flags & Self::FLAG_COMMAND != 0
    }

    pub fn lba(&self) -> u64 {
        lba_from(
            [self.lba0, self.lba1, self.lba2],
            [self.lba3, self.lba4, self.lba5],
        )
    }

    pub fn sector_count(&self) -> u16 {
        u16::from_le_bytes([self.count, self.count_exp])
    }
}

impl Fis for RegH2d {
    const TYPE: FisType = FisType::RegH2d;
}

/// Register FIS - Device to Host (20 bytes)
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RegD2h {
    pub fis_type: u8,
    /// PM port 3:0, I (interrupt) bit 6
    pub flags: u8,
    pub status: u8,
    pub error: u8,
    pub lba0: u8,
    pub lba1: u8,
    pub lba2: u8,
    pub device: u8,
    pub lba3: u8,
    pub lba4: u8,
    pub lba5: u8,
    pub _reserved0: u8,
    pub count: u8,
    pub count_exp: u8,
    pub _reserved1: [u8; 2],
    pub _reserved2: [u8; 4],
}

impl RegD2h {
    pub const FLAG_INTERRUPT: u8 = 1 << 6;

    pub fn new(status: u8, error: u8) -> Self {
        Self {
            fis_type: FIS_TYPE_REG_D2H,
            flags: Self::FLAG_INTERRUPT,
            status,
            error,
            ..Self::default()
        }
    }

    pub fn with_lba(mut self, lba: u64) -> Self {
        let b = lba_bytes(lba);
        self.lba0 = b[0];
        self.lba1 = b[1];
        self.lba2 = b[2];
        self.lba3 = b[3];
        self.lba4 = b[4];
        self.lba5 = b[5];
        self
    }

    pub fn lba(&self) -> u64 {
        lba_from(
            [self.lba0, self.lba1, self.lba2],
            [self.lba3, self.lba4, self.lba5],
        )
    }

    pub fn sector_count(&self) -> u16 {
        u16::from_le_bytes([self.count, self.count_exp])
    }

    pub fn interrupt(&self) -> bool {
        self.flags & Self::FLAG_INTERRUPT != 0
    }
}

impl Fis for RegD2h {
    const TYPE: FisType = FisType::RegD2h;
}

/// DMA Activate FIS (4 bytes)
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct DmaActivate {
    pub fis_type: u8,
    pub pm_port: u8,
    pub _reserved: [u8; 2],
}

impl DmaActivate {
    pub fn new() -> Self {
        Self {
            fis_type: FIS_TYPE_DMA_ACT,
            ..Self::default()
        }
    }
}

impl Fis for DmaActivate {
    const TYPE: FisType = FisType::DmaActivate;
}

/// DMA Setup FIS (28 bytes), first-party DMA
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct DmaSetup {
    pub fis_type: u8,
    /// D (device to host) bit 5, I bit 6, A (auto-activate) bit 7
    pub flags: u8,
    pub _reserved0: [u8; 2],
    pub buffer_id: U64,
    pub _reserved1: [u8; 4],
    pub buffer_offset: U32,
    pub transfer_count: U32,
    pub _reserved2: [u8; 4],
}

impl DmaSetup {
    pub const FLAG_TO_HOST: u8 = 1 << 5;
    pub const FLAG_AUTO_ACTIVATE: u8 = 1 << 7;

    pub fn new(buffer_id: u64, offset: u32, count: u32, to_host: bool) -> Self {
        Self {
            fis_type: FIS_TYPE_DMA_SETUP,
            flags: if to_host { Self::FLAG_TO_HOST } else { 0 },
            buffer_id: U64::new(buffer_id),
            buffer_offset: U32::new(offset),
            transfer_count: U32::new(count),
            ..Self::default()
        }
    }
}

impl Fis for DmaSetup {
    const TYPE: FisType = FisType::DmaSetup;
}

/// PIO Setup FIS (20 bytes)
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct PioSetup {
    pub fis_type: u8,
    /// D (device to host) bit 5, I bit 6
    pub flags: u8,
    pub status: u8,
    pub error: u8,
    pub lba0: u8,
    pub lba1: u8,
    pub lba2: u8,
    pub device: u8,
    pub lba3: u8,
    pub lba4: u8,
    pub lba5: u8,
    pub _reserved0: u8,
    pub count: u8,
    pub count_exp: u8,
    pub _reserved1: u8,
    /// Status after the data phase
    pub e_status: u8,
    /// Bytes in the following Data FIS
    pub transfer_count: U16,
    pub _reserved2: [u8; 2],
}

impl PioSetup {
    pub const FLAG_TO_HOST: u8 = 1 << 5;
    pub const FLAG_INTERRUPT: u8 = 1 << 6;

    pub fn new(to_host: bool, status: u8, e_status: u8, transfer_count: u16) -> Self {
        let mut flags = Self::FLAG_INTERRUPT;
        if to_host {
            flags |= Self::FLAG_TO_HOST;
        }
        Self {
            fis_type: FIS_TYPE_PIO_SETUP,
            flags,
            status,
            e_status,
            transfer_count: U16::new(transfer_count),
            ..Self::default()
        }
    }

    pub fn to_host(&self) -> bool {
        self.flags & Self::FLAG_TO_HOST != 0
    }
}

impl Fis for PioSetup {
    const TYPE: FisType = FisType::PioSetup;
}

/// Set Device Bits FIS (8 bytes)
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct SetDeviceBits {
    pub fis_type: u8,
    /// I bit 6, N bit 7
    pub flags: u8,
    /// Status low 2:0, status high 6:4
    pub status: u8,
    pub error: u8,
    pub protocol_specific: U32,
}

impl SetDeviceBits {
    pub fn new(status: u8, error: u8) -> Self {
        Self {
            fis_type: FIS_TYPE_DEV_BITS,
            flags: 1 << 6,
            status: status & 0x77,
            error,
            ..Self::default()
        }
    }
}

impl Fis for SetDeviceBits {
    const TYPE: FisType = FisType::SetDeviceBits;
}

/// First dword of a Data FIS
pub const fn data_fis_header(pm_port: u8) -> u32 {
    FIS_TYPE_DATA as u32 | ((pm_port as u32 & 0xF) << 8)
}

/// Any FIS other than Data, parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFis {
    RegH2d(RegH2d),
    RegD2h(RegD2h),
    DmaActivate(DmaActivate),
    DmaSetup(DmaSetup),
    PioSetup(PioSetup),
    SetDeviceBits(SetDeviceBits),
}

impl ControlFis {
    /// Parse a complete control FIS
    pub fn parse(dwords: &[u32]) -> Result<Self, FisError> {
        let first = *dwords.first().ok_or(FisError::Truncated)?;
        match FisType::of(first) {
            Some(FisType::RegH2d) => RegH2d::from_dwords(dwords).map(ControlFis::RegH2d),
            Some(FisType::RegD2h) => RegD2h::from_dwords(dwords).map(ControlFis::RegD2h),
            Some(FisType::DmaActivate) => {
                DmaActivate::from_dwords(dwords).map(ControlFis::DmaActivate)
            }
            Some(FisType::DmaSetup) => DmaSetup::from_dwords(dwords).map(ControlFis::DmaSetup),
            Some(FisType::PioSetup) => PioSetup::from_dwords(dwords).map(ControlFis::PioSetup),
            Some(FisType::SetDeviceBits) => {
                SetDeviceBits::from_dwords(dwords).map(ControlFis::SetDeviceBits)
            }
            Some(FisType::Data) | None => Err(FisError::UnknownType(first as u8)),
        }
    }

    pub fn fis_type(&self) -> FisType {
        match self {
            ControlFis::RegH2d(_) => FisType::RegH2d,
            ControlFis::RegD2h(_) => FisType::RegD2h,
            ControlFis::DmaActivate(_) => FisType::DmaActivate,
            ControlFis::DmaSetup(_) => FisType::DmaSetup,
            ControlFis::PioSetup(_) => FisType::PioSetup,
            ControlFis::SetDeviceBits(_) => FisType::SetDeviceBits,
        }
    }

    pub fn to_dwords(&self) -> heapless::Vec<u32, SHADOW_FIS_WORDS> {
        match self {
            ControlFis::RegH2d(f) => f.to_dwords(),
            ControlFis::RegD2h(f) => f.to_dwords(),
            ControlFis::DmaActivate(f) => f.to_dwords(),
            ControlFis::DmaSetup(f) => f.to_dwords(),
            ControlFis::PioSetup(f) => f.to_dwords(),
            ControlFis::SetDeviceBits(f) => f.to_dwords(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_sizes() {
        assert_eq!(core::mem::size_of::<RegH2d>(), 20);
        assert_eq!(core::mem::size_of::<RegD2h>(), 20);
        assert_eq!(core::mem::size_of::<DmaActivate>(), 4);
        assert_eq!(core::mem::size_of::<DmaSetup>(), 28);
        assert_eq!(core::mem::size_of::<PioSetup>(), 20);
        assert_eq!(core::mem::size_of::<SetDeviceBits>(), 8);
    }

    #[test]
    fn type_byte_is_low_byte_of_first_dword() {
        let fis = RegH2d::command(0xEC, 0, 0, 0, 0xA0);
        let dwords = fis.to_dwords();
        assert_eq!(dwords.len(), 5);
        assert_eq!(dwords[0], 0x00EC_8027);
        assert_eq!(FisType::of(dwords[0]), Some(FisType::RegH2d));
        assert_eq!(FisType::of(data_fis_header(0)), Some(FisType::Data));
    }

    #[test]
    fn h2d_carries_48_bit_lba_and_count() {
        let fis = RegH2d::command(0x25, 0, 0x0000_1234_5678_9ABC, 0x0102, 0x40);
        let parsed = RegH2d::from_dwords(&fis.to_dwords()).unwrap();
        assert_eq!(parsed.lba(), 0x1234_5678_9ABC);
        assert_eq!(parsed.sector_count(), 0x0102);
        assert!(parsed.is_command());
        assert!(!RegH2d::control(0x04).is_command());
    }

    #[test]
    fn parse_dispatches_on_type() {
        let d2h = RegD2h::new(0x50, 0).with_lba(7);
        assert_eq!(
            ControlFis::parse(&d2h.to_dwords()),
            Ok(ControlFis::RegD2h(d2h))
        );
        let pio = PioSetup::new(true, 0x58, 0x50, 512);
        let parsed = ControlFis::parse(&pio.to_dwords()).unwrap();
        assert_eq!(parsed.fis_type(), FisType::PioSetup);
        match parsed {
            ControlFis::PioSetup(p) => {
                assert!(p.to_host());
                assert_eq!(p.transfer_count.get(), 512);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn malformed_control_fis() {
        assert_eq!(ControlFis::parse(&[]), Err(FisError::Truncated));
        assert_eq!(
            ControlFis::parse(&[FIS_TYPE_REG_D2H as u32, 0]),
            Err(FisError::Truncated)
        );
        assert_eq!(ControlFis::parse(&[0x77]), Err(FisError::UnknownType(0x77)));
        assert_eq!(
            RegD2h::from_dwords(&DmaActivate::new().to_dwords().iter().chain(&[0; 4]).copied().collect::<Vec<_>>()),
            Err(FisError::WrongType {
                expected: FisType::RegD2h,
                found: FIS_TYPE_DMA_ACT
            })
        );
    }
}
