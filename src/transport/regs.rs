//! Register/shadow interface using tock-registers
//!
//! A small file of 32-bit registers seen by the external bus adapter. The
//! task-file registers are staged by the adapter and sent in the Register
//! H2D FIS; status, error and (for D2H) LBA/count/device are updated only
//! from complete, intact FIS.

use tock_registers::{LocalRegisterCopy, register_bitfields};

use super::command::CommandError;
use super::fis::{PioSetup, RegD2h, SetDeviceBits};

// ============================================================================
// Register Bitfield Definitions
// ============================================================================

register_bitfields! [
    u32,
    /// Features (FEATURES) Register
    pub FEATURES [
        /// Features 7:0
        FEATURE OFFSET(0) NUMBITS(8) [],
        /// Features 15:8 (48-bit commands)
        FEATURE_EXP OFFSET(8) NUMBITS(8) []
    ],

    /// LBA 47:32 (LBA_HIGH) Register
    pub LBA_HIGH [
        LBA OFFSET(0) NUMBITS(16) []
    ],

    /// Sector Count (COUNT) Register
    pub COUNT [
        COUNT OFFSET(0) NUMBITS(16) []
    ],

    /// Device and Device Control (DEVICE) Register
    pub DEVICE [
        /// Device register
        DEVICE OFFSET(0) NUMBITS(8) [],
        /// Device Control register
        CONTROL OFFSET(8) NUMBITS(8) []
    ],

    /// Status and Error (STATUS) Register
    pub STATUS [
        /// Error
        ERR OFFSET(0) NUMBITS(1) [],
        /// Data Request
        DRQ OFFSET(3) NUMBITS(1) [],
        /// Device Ready
        DRDY OFFSET(6) NUMBITS(1) [],
        /// Busy
        BSY OFFSET(7) NUMBITS(1) [],
        /// Whole ATA status byte
        STATUS OFFSET(0) NUMBITS(8) [],
        /// ATA error byte
        ERROR OFFSET(8) NUMBITS(8) [
            NoError = 0x00
        ]
    ]
];

// ============================================================================
// Constants
// ============================================================================

/// ATA status bits, as they appear in FIS status bytes
pub const ATA_SR_ERR: u8 = 1 << 0;
pub const ATA_SR_DRQ: u8 = 1 << 3;
pub const ATA_SR_DRDY: u8 = 1 << 6;
pub const ATA_SR_BSY: u8 = 1 << 7;

/// ATA error register: command aborted
pub const ATA_ER_ABRT: u8 = 0x04;
/// ATA error register: ID not found
pub const ATA_ER_IDNF: u8 = 0x10;

/// Device signature for ATA (hard drive)
pub const SATA_SIG_ATA: u32 = 0x0000_0101;

/// Device Control: software reset
pub const ATA_CTL_SRST: u8 = 1 << 2;

bitflags::bitflags! {
    /// Transport error record (ERRORS register, write 1 to clear)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransportErrors: u32 {
        /// PHY not ready while a command was in flight
        const LINK_DOWN = 1 << 0;
        /// Register H2D FIS failed on every attempt
        const TX_RETRY_EXHAUSTED = 1 << 1;
        /// Memory-to-device DMA engine error
        const MM2S = 1 << 2;
        /// Device-to-memory DMA engine error
        const S2MM = 1 << 3;
        /// Received a FIS of unknown type
        const UNKNOWN_FIS = 1 << 4;
        /// Received a truncated or overlong FIS
        const MALFORMED_FIS = 1 << 5;
        /// Received a frame the link aborted
        const RX_ABORT = 1 << 6;
        /// An outgoing Data FIS was not acknowledged
        const DATA_FIS_FAILED = 1 << 7;
    }
}

/// Register offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Register {
    Command = 0x00,
    Features = 0x04,
    LbaLow = 0x08,
    LbaHigh = 0x0C,
    Count = 0x10,
    Device = 0x14,
    Status = 0x18,
    DmaAddrLow = 0x1C,
    DmaAddrHigh = 0x20,
    Errors = 0x24,
}

impl TryFrom<u32> for Register {
    type Error = RegisterError;

    fn try_from(offset: u32) -> Result<Self, Self::Error> {
        Ok(match offset {
            0x00 => Register::Command,
            0x04 => Register::Features,
            0x08 => Register::LbaLow,
            0x0C => Register::LbaHigh,
            0x10 => Register::Count,
            0x14 => Register::Device,
            0x18 => Register::Status,
            0x1C => Register::DmaAddrLow,
            0x20 => Register::DmaAddrHigh,
            0x24 => Register::Errors,
            _ => return Err(RegisterError::InvalidOffset(offset)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    /// Shadow register write while BSY
    Busy,
    ReadOnly,
    InvalidOffset(u32),
    /// Writing COMMAND did not issue the command
    Command(CommandError),
}

impl From<CommandError> for RegisterError {
    fn from(err: CommandError) -> Self {
        RegisterError::Command(err)
    }
}

/// The shadow register file
pub struct Registers {
    command: u8,
    features: LocalRegisterCopy<u32, FEATURES::Register>,
    lba_low: u32,
    lba_high: LocalRegisterCopy<u32, LBA_HIGH::Register>,
    count: LocalRegisterCopy<u32, COUNT::Register>,
    device: LocalRegisterCopy<u32, DEVICE::Register>,
    status: LocalRegisterCopy<u32, STATUS::Register>,
    dma_addr: u64,
    errors: TransportErrors,
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

impl Registers {
    pub fn new() -> Self {
        Self {
            command: 0,
            features: LocalRegisterCopy::new(0),
            lba_low: 0,
            lba_high: LocalRegisterCopy::new(0),
            count: LocalRegisterCopy::new(0),
            device: LocalRegisterCopy::new(0),
            status: LocalRegisterCopy::new(0),
            dma_addr: 0,
            errors: TransportErrors::empty(),
        }
    }

    pub fn read(&self, reg: Register) -> u32 {
        match reg {
            Register::Command => u32::from(self.command),
            Register::Features => self.features.get(),
            Register::LbaLow => self.lba_low,
            Register::LbaHigh => self.lba_high.get(),
            Register::Count => self.count.get(),
            Register::Device => self.device.get(),
            Register::Status => self.status.get(),
            Register::DmaAddrLow => self.dma_addr as u32,
            Register::DmaAddrHigh => (self.dma_addr >> 32) as u32,
            Register::Errors => self.errors.bits(),
        }
    }

    /// Write anything but COMMAND
    pub fn write(&mut self, reg: Register, value: u32) -> Result<(), RegisterError> {
        match reg {
            Register::Status => return Err(RegisterError::ReadOnly),
            Register::Errors => {
                self.errors.remove(TransportErrors::from_bits_truncate(value));
                return Ok(());
            }
            Register::Command => return Err(RegisterError::InvalidOffset(reg as u32)),
            _ => {}
        }
        if self.is_busy() {
            return Err(RegisterError::Busy);
        }
        match reg {
            Register::Features => self.features.set(value & 0xFFFF),
            Register::LbaLow => self.lba_low = value,
            Register::LbaHigh => self.lba_high.set(value & 0xFFFF),
            Register::Count => self.count.set(value & 0xFFFF),
            Register::Device => self.device.set(value & 0xFFFF),
            Register::DmaAddrLow => {
                self.dma_addr = (self.dma_addr & !0xFFFF_FFFF) | u64::from(value);
            }
            Register::DmaAddrHigh => {
                self.dma_addr = (self.dma_addr & 0xFFFF_FFFF) | (u64::from(value) << 32);
            }
            Register::Status | Register::Errors | Register::Command => {}
        }
        Ok(())
    }

    pub fn command(&self) -> u8 {
        self.command
    }

    pub fn features(&self) -> u16 {
        (self.features.read(FEATURES::FEATURE) | self.features.read(FEATURES::FEATURE_EXP) << 8)
            as u16
    }

    pub fn lba(&self) -> u64 {
        u64::from(self.lba_low) | u64::from(self.lba_high.read(LBA_HIGH::LBA)) << 32
    }

    pub fn sector_count(&self) -> u16 {
        self.count.read(COUNT::COUNT) as u16
    }

    pub fn device(&self) -> u8 {
        self.device.read(DEVICE::DEVICE) as u8
    }

    pub fn control(&self) -> u8 {
        self.device.read(DEVICE::CONTROL) as u8
    }

    pub fn status(&self) -> u8 {
        self.status.read(STATUS::STATUS) as u8
    }

    pub fn error(&self) -> u8 {
        self.status.read(STATUS::ERROR) as u8
    }

    pub fn is_busy(&self) -> bool {
        self.status.is_set(STATUS::BSY)
    }

    pub fn dma_addr(&self) -> u64 {
        self.dma_addr
    }

    pub fn errors(&self) -> TransportErrors {
        self.errors
    }

    pub fn record(&mut self, errors: TransportErrors) {
        self.errors.insert(errors);
    }

    /// AHCI-style signature assembled from the last D2H FIS
    pub fn signature(&self) -> u32 {
        (self.lba_low & 0x00FF_FFFF) << 8 | (self.count.get() & 0xFF)
    }

    /// A command was accepted: latch it and raise BSY
    pub(crate) fn begin(&mut self, command: u8) {
        self.command = command;
        self.status
            .modify(STATUS::BSY::SET + STATUS::DRQ::CLEAR + STATUS::ERR::CLEAR + STATUS::ERROR::NoError);
    }

    /// End the command with the given status and error bytes
    pub(crate) fn finish(&mut self, status: u8, error: u8) {
        self.status
            .modify(STATUS::STATUS.val(u32::from(status)) + STATUS::ERROR.val(u32::from(error)));
        self.status.modify(STATUS::BSY::CLEAR);
    }

    /// End the command with an abort error
    pub(crate) fn abort(&mut self) {
        self.finish(ATA_SR_DRDY | ATA_SR_ERR, ATA_ER_ABRT);
    }

    pub(crate) fn set_drq(&mut self, drq: bool) {
        if drq {
            self.status.modify(STATUS::DRQ::SET);
        } else {
            self.status.modify(STATUS::DRQ::CLEAR);
        }
    }

    /// Drop BSY and DRQ without touching the rest
    pub(crate) fn clear_busy(&mut self) {
        self.status.modify(STATUS::BSY::CLEAR + STATUS::DRQ::CLEAR);
    }

    pub(crate) fn advance_dma_addr(&mut self, bytes: u32) {
        self.dma_addr = self.dma_addr.wrapping_add(u64::from(bytes));
    }

    pub(crate) fn publish_d2h(&mut self, fis: &RegD2h) {
        let lba = fis.lba();
        self.lba_low = lba as u32;
        self.lba_high.set((lba >> 32) as u32 & 0xFFFF);
        self.count.set(u32::from(fis.sector_count()));
        self.device.modify(DEVICE::DEVICE.val(u32::from(fis.device)));
        self.finish(fis.status, fis.error);
    }

    /// PIO Setup: status goes live with BSY held, DRQ follows the setup
    pub(crate) fn publish_pio_setup(&mut self, fis: &PioSetup) {
        self.status.modify(
            STATUS::STATUS.val(u32::from(fis.status | ATA_SR_BSY))
                + STATUS::ERROR.val(u32::from(fis.error)),
        );
        self.set_drq(true);
    }

    /// Set Device Bits: only the status bits it carries change
    pub(crate) fn publish_sdb(&mut self, fis: &SetDeviceBits) {
        let keep = self.status() & !0x77;
        let status = keep | (fis.status & 0x77);
        self.status.modify(
            STATUS::STATUS.val(u32::from(status)) + STATUS::ERROR.val(u32::from(fis.error)),
        );
    }
}
