//! ATA command classification
//!
//! A fixed 256-entry table maps every command code to the protocol its data
//! phase uses. Codes missing from the table are rejected at issue time.

/// Read Sectors (PIO, 28-bit LBA)
pub const ATA_CMD_READ_SECTORS: u8 = 0x20;
/// Read Sectors Extended (PIO, 48-bit LBA)
pub const ATA_CMD_READ_SECTORS_EXT: u8 = 0x24;
/// Read DMA Extended (48-bit LBA)
pub const ATA_CMD_READ_DMA_EXT: u8 = 0x25;
/// Write Sectors (PIO, 28-bit LBA)
pub const ATA_CMD_WRITE_SECTORS: u8 = 0x30;
/// Write Sectors Extended (PIO, 48-bit LBA)
pub const ATA_CMD_WRITE_SECTORS_EXT: u8 = 0x34;
/// Write DMA Extended (48-bit LBA)
pub const ATA_CMD_WRITE_DMA_EXT: u8 = 0x35;
/// Read DMA (28-bit LBA)
pub const ATA_CMD_READ_DMA: u8 = 0xC8;
/// Write DMA (28-bit LBA)
pub const ATA_CMD_WRITE_DMA: u8 = 0xCA;
/// Flush Cache
pub const ATA_CMD_FLUSH_CACHE: u8 = 0xE7;
/// Flush Cache Extended
pub const ATA_CMD_FLUSH_CACHE_EXT: u8 = 0xEA;
/// Identify Device
pub const ATA_CMD_IDENTIFY: u8 = 0xEC;
/// Set Features
pub const ATA_CMD_SET_FEATURES: u8 = 0xEF;

/// Why a command was not issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    /// A command is already in flight
    Busy,
    UnknownCommand(u8),
    /// The link is not up
    LinkDown,
}

/// Sector size in bytes
pub const SECTOR_SIZE: u32 = 512;

/// How a command moves its data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    NonData,
    /// PIO, device to host
    PioIn,
    /// PIO, host to device
    PioOut,
    /// DMA, device to host
    DmaIn,
    /// DMA, host to device
    DmaOut,
}

impl Protocol {
    /// Data flows from device to host
    pub fn is_read(self) -> bool {
        matches!(self, Protocol::PioIn | Protocol::DmaIn)
    }

    pub fn is_write(self) -> bool {
        matches!(self, Protocol::PioOut | Protocol::DmaOut)
    }
}

/// One table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandInfo {
    pub protocol: Protocol,
    /// Uses the extended (48-bit) register set
    pub lba48: bool,
    /// Data length is fixed instead of sector-count based (bytes)
    pub fixed_len: Option<u32>,
}

impl CommandInfo {
    const fn new(protocol: Protocol, lba48: bool) -> Self {
        Self {
            protocol,
            lba48,
            fixed_len: None,
        }
    }

    const fn fixed(protocol: Protocol, len: u32) -> Self {
        Self {
            protocol,
            lba48: false,
            fixed_len: Some(len),
        }
    }

    /// Bytes moved by the data phase for a given sector count register
    ///
    /// A count of zero means 256 sectors (28-bit) or 65536 sectors (48-bit).
    pub fn transfer_len(&self, count: u16) -> u32 {
        if self.protocol == Protocol::NonData {
            return 0;
        }
        if let Some(len) = self.fixed_len {
            return len;
        }
        let sectors = if self.lba48 {
            if count == 0 { 65536 } else { u32::from(count) }
        } else {
            match count as u8 {
                0 => 256,
                n => u32::from(n),
            }
        };
        sectors * SECTOR_SIZE
    }
}

use Protocol::*;

const COMMANDS: &[(u8, CommandInfo)] = &[
    // Non-data
    (0x00, CommandInfo::new(NonData, false)), // NOP
    (0x10, CommandInfo::new(NonData, false)), // RECALIBRATE
    (0x27, CommandInfo::new(NonData, true)),  // READ NATIVE MAX ADDRESS EXT
    (0x40, CommandInfo::new(NonData, false)), // READ VERIFY SECTORS
    (0x42, CommandInfo::new(NonData, true)),  // READ VERIFY SECTORS EXT
    (0x70, CommandInfo::new(NonData, false)), // SEEK
    (0x90, CommandInfo::new(NonData, false)), // EXECUTE DEVICE DIAGNOSTIC
    (0x91, CommandInfo::new(NonData, false)), // INITIALIZE DEVICE PARAMETERS
    (0xC6, CommandInfo::new(NonData, false)), // SET MULTIPLE MODE
    (0xE0, CommandInfo::new(NonData, false)), // STANDBY IMMEDIATE
    (0xE1, CommandInfo::new(NonData, false)), // IDLE IMMEDIATE
    (0xE2, CommandInfo::new(NonData, false)), // STANDBY
    (0xE3, CommandInfo::new(NonData, false)), // IDLE
    (0xE5, CommandInfo::new(NonData, false)), // CHECK POWER MODE
    (0xE6, CommandInfo::new(NonData, false)), // SLEEP
    (ATA_CMD_FLUSH_CACHE, CommandInfo::new(NonData, false)),
    (ATA_CMD_FLUSH_CACHE_EXT, CommandInfo::new(NonData, true)),
    (ATA_CMD_SET_FEATURES, CommandInfo::new(NonData, false)),
    (0xF5, CommandInfo::new(NonData, false)), // SECURITY FREEZE LOCK
    (0xF8, CommandInfo::new(NonData, false)), // READ NATIVE MAX ADDRESS
    // PIO data-in
    (ATA_CMD_READ_SECTORS, CommandInfo::new(PioIn, false)),
    (ATA_CMD_READ_SECTORS_EXT, CommandInfo::new(PioIn, true)),
    (0x29, CommandInfo::new(PioIn, true)),  // READ MULTIPLE EXT
    (0x2F, CommandInfo::new(PioIn, true)),  // READ LOG EXT
    (0xC4, CommandInfo::new(PioIn, false)), // READ MULTIPLE
    (0xE4, CommandInfo::fixed(PioIn, 512)), // READ BUFFER
    (ATA_CMD_IDENTIFY, CommandInfo::fixed(PioIn, 512)),
    // PIO data-out
    (ATA_CMD_WRITE_SECTORS, CommandInfo::new(PioOut, false)),
    (ATA_CMD_WRITE_SECTORS_EXT, CommandInfo::new(PioOut, true)),
    (0x39, CommandInfo::new(PioOut, true)),  // WRITE MULTIPLE EXT
    (0x3F, CommandInfo::new(PioOut, true)),  // WRITE LOG EXT
    (0x92, CommandInfo::new(PioOut, false)), // DOWNLOAD MICROCODE
    (0xC5, CommandInfo::new(PioOut, false)), // WRITE MULTIPLE
    (0xE8, CommandInfo::fixed(PioOut, 512)), // WRITE BUFFER
    // DMA data-in
    (ATA_CMD_READ_DMA_EXT, CommandInfo::new(DmaIn, true)),
    (0x47, CommandInfo::new(DmaIn, true)),  // READ LOG DMA EXT
    (ATA_CMD_READ_DMA, CommandInfo::new(DmaIn, false)),
    (0xE9, CommandInfo::fixed(DmaIn, 512)), // READ BUFFER DMA
    // DMA data-out
    (0x06, CommandInfo::new(DmaOut, true)), // DATA SET MANAGEMENT
    (ATA_CMD_WRITE_DMA_EXT, CommandInfo::new(DmaOut, true)),
    (0x3D, CommandInfo::new(DmaOut, true)), // WRITE DMA FUA EXT
    (0x57, CommandInfo::new(DmaOut, true)), // WRITE LOG DMA EXT
    (ATA_CMD_WRITE_DMA, CommandInfo::new(DmaOut, false)),
    (0xEB, CommandInfo::fixed(DmaOut, 512)), // WRITE BUFFER DMA
];

const fn build_table() -> [Option<CommandInfo>; 256] {
    let mut table = [None; 256];
    let mut i = 0;
    while i < COMMANDS.len() {
        let (code, info) = COMMANDS[i];
        table[code as usize] = Some(info);
        i += 1;
    }
    table
}

static COMMAND_TABLE: [Option<CommandInfo>; 256] = build_table();

/// Look up a command code
pub fn classify(code: u8) -> Option<CommandInfo> {
    COMMAND_TABLE[code as usize]
}
