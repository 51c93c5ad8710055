//! Scripted SATA device
//!
//! The far end of a [`crate::phy::Wire`] for tests and the demo binary. It
//! reuses the link layer and FIS router with the `Device` role and answers
//! ATA commands from a sector store in a byte slice:
//!
//! - non-data: Register D2H
//! - PIO data-in: PIO Setup + Data FIS per sector, no closing D2H
//! - PIO data-out: PIO Setup per sector, D2H after the last one
//! - DMA data-in: Data FIS chunks + D2H
//! - DMA data-out: DMA Activate per chunk + D2H
//!
//! Unknown opcodes are aborted and out-of-range LBAs fail with IDNF.

use crate::config::{LinkConfig, Role};
use crate::link::{Beat, Link, LinkStatus, Word};
use crate::phy::Phy;
use crate::transport::command::{ATA_CMD_IDENTIFY, Protocol, SECTOR_SIZE, classify};
use crate::transport::fis::{
    ControlFis, DmaActivate, Fis, MAX_DATA_FIS_WORDS, PioSetup, RegD2h, RegH2d, SHADOW_FIS_WORDS,
    data_fis_header,
};
use crate::transport::regs::{
    ATA_CTL_SRST, ATA_ER_ABRT, ATA_ER_IDNF, ATA_SR_DRDY, ATA_SR_DRQ, ATA_SR_ERR,
};
use crate::transport::router::{Routed, Router};

/// Size of the IDENTIFY block and the device buffer
pub const BLOCK_SIZE: usize = 512;

/// Largest DMA chunk per Data FIS, bytes
const DMA_CHUNK: usize = MAX_DATA_FIS_WORDS * 4;

const REPLY_QUEUE: usize = 4;

/// Where a data phase reads from or writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Disk,
    Identify,
    /// READ BUFFER / WRITE BUFFER scratch block
    Buffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    /// Sending read data
    DataIn {
        pio: bool,
        target: Target,
        offset: usize,
        remaining: usize,
        setup_sent: bool,
    },
    /// Receiving write data
    DataOut {
        pio: bool,
        target: Target,
        offset: usize,
        remaining: usize,
    },
}

enum Frame {
    Control {
        words: heapless::Vec<u32, SHADOW_FIS_WORDS>,
        next: usize,
    },
    Data {
        target: Target,
        offset: usize,
        words: usize,
        header_sent: bool,
    },
}

impl Frame {
    /// Some beats are already with the link
    fn started(&self) -> bool {
        match self {
            Frame::Control { next, .. } => *next > 0,
            Frame::Data { header_sent, .. } => *header_sent,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStats {
    pub commands: u32,
    pub errors: u32,
    pub frames_sent: u32,
    pub tx_failed: u32,
    pub rx_bad: u32,
    /// Device Control FISes with SRST set
    pub resets: u32,
}

pub struct Device<'a> {
    link: Link,
    router: Router,
    disk: &'a mut [u8],
    identify: [u8; BLOCK_SIZE],
    buffer: [u8; BLOCK_SIZE],
    state: State,
    replies: heapless::Deque<Frame, REPLY_QUEUE>,
    current: Option<Frame>,
    /// Word the serializer refused; the link stalls until it is taken
    held: Option<Word>,
    fail_next: bool,
    stats: DeviceStats,
}

impl<'a> Device<'a> {
    pub fn new(disk: &'a mut [u8]) -> Self {
        Self::with_config(LinkConfig::new(), disk)
    }

    /// The role in `config` is forced to `Device`
    pub fn with_config(config: LinkConfig, disk: &'a mut [u8]) -> Self {
        let sectors = (disk.len() / SECTOR_SIZE as usize) as u64;
        Self {
            link: Link::new(config.with_role(Role::Device)),
            router: Router::new(),
            disk,
            identify: identify_data(sectors),
            buffer: [0; BLOCK_SIZE],
            state: State::Idle,
            replies: heapless::Deque::new(),
            current: None,
            held: None,
            fail_next: false,
            stats: DeviceStats::default(),
        }
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn disk(&self) -> &[u8] {
        &*self.disk
    }

    pub fn stats(&self) -> DeviceStats {
        self.stats
    }

    /// No command in progress and nothing left to send
    pub fn is_idle(&self) -> bool {
        self.state == State::Idle && self.current.is_none() && self.replies.is_empty()
    }

    /// Abort the next command regardless of its opcode
    pub fn fail_next_command(&mut self) {
        self.fail_next = true;
    }

    /// One clock on the device side of the cable
    pub fn step<P: Phy>(&mut self, phy: &mut P) -> LinkStatus {
        if let Some(word) = phy.recv() {
            self.link.receive(word);
        }
        if let Some(word) = self.held.take() {
            if let Err(word) = phy.send(word) {
                self.held = Some(word);
                self.drain_rx();
                self.pump_tx();
                return LinkStatus::empty();
            }
        }
        let out = self.link.step(phy.link_ready());
        if let Err(word) = phy.send(out.word) {
            log::debug!("SIM: serializer full, stalling on {:?}", word);
            self.held = Some(word);
        }
        if out.phy_reset_request() {
            phy.request_reset();
        }

        let status = out.status;
        if status.contains(LinkStatus::LINK_DOWN) {
            self.drop_all();
        }
        if status.contains(LinkStatus::LINK_UP) {
            self.drop_all();
            self.send_signature();
        }
        if status.contains(LinkStatus::TX_FAILED) {
            log::warn!("SIM: frame not delivered");
            self.stats.tx_failed += 1;
        }
        if status.contains(LinkStatus::RX_BAD_END) {
            self.stats.rx_bad += 1;
            if matches!(self.state, State::DataOut { .. }) {
                log::warn!("SIM: write data lost, aborting command");
                self.finish_error(ATA_ER_ABRT);
            }
        }

        self.drain_rx();
        self.pump_tx();
        status
    }

    fn drop_all(&mut self) {
        self.state = State::Idle;
        self.replies.clear();
        if let Some(frame) = self.current.take() {
            self.link.tx_mut().abort();
            // A half-pushed frame has to be closed or the link keeps
            // swallowing beats
            if frame.started() && self.link.tx_mut().push(Beat::new(0, true)).is_err() {
                log::warn!("SIM: could not close aborted frame");
            }
        }
        self.router.reset();
    }

    /// Power-on signature: ATA device, sector count and LBA low of 1
    fn send_signature(&mut self) {
        let mut sig = RegD2h::new(ATA_SR_DRDY, 0).with_lba(1);
        sig.count = 1;
        self.reply(sig.to_dwords());
    }

    fn reply(&mut self, words: heapless::Vec<u32, SHADOW_FIS_WORDS>) {
        if self.replies.push_back(Frame::Control { words, next: 0 }).is_err() {
            log::warn!("SIM: reply queue full, FIS dropped");
        }
    }

    fn finish_ok(&mut self) {
        self.state = State::Idle;
        self.reply(RegD2h::new(ATA_SR_DRDY, 0).to_dwords());
    }

    fn finish_error(&mut self, error: u8) {
        self.state = State::Idle;
        self.stats.errors += 1;
        self.reply(RegD2h::new(ATA_SR_DRDY | ATA_SR_ERR, error).to_dwords());
    }

    fn drain_rx(&mut self) {
        while let Some(beat) = self.link.rx_mut().pop() {
            match self.router.route(beat) {
                Routed::Pending => {}
                Routed::Data(word) => {
                    if word.last && word.abort {
                        continue;
                    }
                    self.on_data(word.data, word.last);
                }
                Routed::Control(ControlFis::RegH2d(h2d)) => self.on_h2d(&h2d),
                Routed::Control(fis) => {
                    log::debug!("SIM: ignoring {:?}", fis.fis_type());
                }
                Routed::Dropped(reason) => {
                    log::warn!("SIM: frame dropped: {:?}", reason);
                }
            }
        }
    }

    fn on_h2d(&mut self, h2d: &RegH2d) {
        if !h2d.is_command() {
            if h2d.control & ATA_CTL_SRST != 0 {
                log::info!("SIM: software reset");
                self.stats.resets += 1;
                self.drop_all();
            }
            return;
        }
        if self.state != State::Idle {
            log::warn!("SIM: command {:#04x} while busy, ignored", h2d.command);
            return;
        }
        self.stats.commands += 1;
        self.execute(h2d);
    }

    fn execute(&mut self, h2d: &RegH2d) {
        let Some(info) = classify(h2d.command) else {
            log::warn!("SIM: unsupported command {:#04x}", h2d.command);
            return self.finish_error(ATA_ER_ABRT);
        };
        if self.fail_next {
            self.fail_next = false;
            log::info!("SIM: failing command {:#04x} on request", h2d.command);
            return self.finish_error(ATA_ER_ABRT);
        }
        let len = info.transfer_len(h2d.sector_count()) as usize;
        log::debug!(
            "SIM: command {:#04x} {:?} lba {:#x} len {}",
            h2d.command,
            info.protocol,
            h2d.lba(),
            len
        );

        let (target, offset) = if h2d.command == ATA_CMD_IDENTIFY {
            (Target::Identify, 0)
        } else if info.fixed_len.is_some() {
            (Target::Buffer, 0)
        } else if info.protocol == Protocol::NonData {
            (Target::Disk, 0)
        } else {
            match disk_range(self.disk.len(), h2d.lba(), len) {
                Some(offset) => (Target::Disk, offset),
                None => {
                    log::warn!("SIM: lba {:#x} + {} bytes out of range", h2d.lba(), len);
                    return self.finish_error(ATA_ER_IDNF);
                }
            }
        };

        match info.protocol {
            Protocol::NonData => self.finish_ok(),
            Protocol::PioIn | Protocol::DmaIn => {
                self.state = State::DataIn {
                    pio: info.protocol == Protocol::PioIn,
                    target,
                    offset,
                    remaining: len,
                    setup_sent: false,
                };
            }
            Protocol::PioOut | Protocol::DmaOut => {
                self.state = State::DataOut {
                    pio: info.protocol == Protocol::PioOut,
                    target,
                    offset,
                    remaining: len,
                };
                self.request_block();
            }
        }
    }

    /// Ask the host for the next write block
    fn request_block(&mut self) {
        let State::DataOut { pio, remaining, .. } = self.state else {
            return;
        };
        if pio {
            let block = remaining.min(BLOCK_SIZE) as u16;
            let setup = PioSetup::new(false, ATA_SR_DRDY | ATA_SR_DRQ, ATA_SR_DRDY, block);
            self.reply(setup.to_dwords());
        } else {
            self.reply(DmaActivate::new().to_dwords());
        }
    }

    fn on_data(&mut self, data: u32, last: bool) {
        let State::DataOut {
            target,
            offset,
            remaining,
            ..
        } = &mut self.state
        else {
            log::warn!("SIM: unexpected data {:#010x}", data);
            return;
        };
        if *remaining >= 4 {
            let store: &mut [u8] = match target {
                Target::Disk => &mut *self.disk,
                Target::Identify => &mut self.identify,
                Target::Buffer => &mut self.buffer,
            };
            store[*offset..*offset + 4].copy_from_slice(&data.to_be_bytes());
            *offset += 4;
            *remaining -= 4;
        }
        if last {
            if *remaining == 0 {
                self.finish_ok();
            } else {
                self.request_block();
            }
        }
    }

    /// Next frame of a read, or its closing status
    fn next_data_in(&mut self) -> Option<Frame> {
        let State::DataIn {
            pio,
            target,
            offset,
            remaining,
            setup_sent,
        } = &mut self.state
        else {
            return None;
        };
        if *remaining == 0 {
            let pio = *pio;
            self.state = State::Idle;
            // PIO data-in ends with the E_Status of its last setup
            return (!pio).then(|| Frame::Control {
                words: RegD2h::new(ATA_SR_DRDY, 0).to_dwords(),
                next: 0,
            });
        }
        if *pio && !*setup_sent {
            *setup_sent = true;
            let block = (*remaining).min(BLOCK_SIZE) as u16;
            let setup = PioSetup::new(true, ATA_SR_DRDY | ATA_SR_DRQ, ATA_SR_DRDY, block);
            return Some(Frame::Control {
                words: setup.to_dwords(),
                next: 0,
            });
        }
        let block = (*remaining).min(if *pio { BLOCK_SIZE } else { DMA_CHUNK });
        let frame = Frame::Data {
            target: *target,
            offset: *offset,
            words: block.div_ceil(4),
            header_sent: false,
        };
        *offset += block;
        *remaining -= block;
        *setup_sent = false;
        Some(frame)
    }

    fn pump_tx(&mut self) {
        loop {
            if self.current.is_none() {
                let next = match self.replies.pop_front() {
                    Some(frame) => Some(frame),
                    None => self.next_data_in(),
                };
                self.current = next;
            }
            let Some(frame) = self.current.as_mut() else {
                return;
            };
            if !self.link.tx().ready() {
                return;
            }
            let (beat, done) = match frame {
                Frame::Control { words, next } => {
                    let last = *next + 1 >= words.len();
                    let beat = Beat::new(words[*next], last);
                    *next += 1;
                    (beat, last)
                }
                Frame::Data {
                    target,
                    offset,
                    words,
                    header_sent,
                } => {
                    if !*header_sent {
                        *header_sent = true;
                        (Beat::new(data_fis_header(0), false), false)
                    } else {
                        let store: &[u8] = match target {
                            Target::Disk => &*self.disk,
                            Target::Identify => &self.identify,
                            Target::Buffer => &self.buffer,
                        };
                        let mut bytes = [0u8; 4];
                        bytes.copy_from_slice(&store[*offset..*offset + 4]);
                        *offset += 4;
                        *words -= 1;
                        (Beat::new(u32::from_le_bytes(bytes), *words == 0), *words == 0)
                    }
                }
            };
            if self.link.tx_mut().push(beat).is_err() {
                log::error!("SIM: link refused a beat it reported room for");
                return;
            }
            if done {
                self.current = None;
                self.stats.frames_sent += 1;
            }
        }
    }
}

/// Byte offset of `len` bytes starting at `lba`, if they fit
fn disk_range(disk_len: usize, lba: u64, len: usize) -> Option<usize> {
    let start = usize::try_from(lba).ok()?.checked_mul(SECTOR_SIZE as usize)?;
    let end = start.checked_add(len)?;
    (end <= disk_len).then_some(start)
}

/// Store an ATA string: two characters per word, first in the high byte,
/// padded with spaces
fn put_ata_string(words: &mut [u16], text: &str) {
    let mut chars = text.bytes().chain(core::iter::repeat(b' '));
    for word in words {
        let hi = chars.next().unwrap_or(b' ');
        let lo = chars.next().unwrap_or(b' ');
        *word = u16::from(hi) << 8 | u16::from(lo);
    }
}

/// IDENTIFY DEVICE data for a disk of `sectors` sectors
pub fn identify_data(sectors: u64) -> [u8; BLOCK_SIZE] {
    let mut words = [0u16; 256];
    // Fixed, non-removable ATA device
    words[0] = 0x0040;
    put_ata_string(&mut words[10..20], "SIM0000001");
    put_ata_string(&mut words[23..27], "1.0");
    put_ata_string(&mut words[27..47], "SATA-STACK SIM DISK");
    // LBA and DMA supported
    words[49] = 1 << 9 | 1 << 8;
    let lba28 = sectors.min(0x0FFF_FFFF) as u32;
    words[60] = lba28 as u16;
    words[61] = (lba28 >> 16) as u16;
    // 48-bit address feature set supported and enabled
    words[83] = 1 << 10;
    words[86] = 1 << 10;
    for (i, word) in words[100..104].iter_mut().enumerate() {
        *word = (sectors >> (16 * i)) as u16;
    }

    let mut bytes = [0u8; BLOCK_SIZE];
    for (chunk, word) in bytes.chunks_exact_mut(2).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    bytes
}

fn identify_word(data: &[u8; BLOCK_SIZE], index: usize) -> u16 {
    u16::from_le_bytes([data[index * 2], data[index * 2 + 1]])
}

/// Total addressable sectors (words 100-103, or 60-61 without 48-bit support)
pub fn identify_sectors(data: &[u8; BLOCK_SIZE]) -> u64 {
    if identify_word(data, 83) & (1 << 10) != 0 {
        (0..4).fold(0u64, |acc, i| {
            acc | u64::from(identify_word(data, 100 + i)) << (16 * i)
        })
    } else {
        u64::from(identify_word(data, 60)) | u64::from(identify_word(data, 61)) << 16
    }
}

/// Model string (words 27-46), trailing spaces trimmed
pub fn identify_model(data: &[u8; BLOCK_SIZE]) -> heapless::String<40> {
    let mut model = heapless::String::new();
    for i in 27..47 {
        let [lo, hi] = identify_word(data, i).to_le_bytes();
        for c in [hi, lo] {
            if (0x20..0x7F).contains(&c) && model.push(c as char).is_err() {
                break;
            }
        }
    }
    while model.ends_with(' ') {
        model.pop();
    }
    model
}
