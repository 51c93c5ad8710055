//! Transport layer state machine
//!
//! Turns a register write into a Register H2D FIS, then follows the
//! protocol the command table names for the opcode: PIO Setup driven data
//! phases, DMA data-in, DMA Activate paced data-out, and the closing
//! Register D2H or Set Device Bits FIS. Link events arrive as the
//! [`LinkStatus`] of the same clock.
//!
//! Only one command is ever in flight; a second COMMAND write while busy is
//! refused without touching the register file.

use crate::config::TransportConfig;
use crate::dma::{DmaChannel, DmaDirection, DmaState, DmaWord};
use crate::link::{Beat, Link, LinkStatus};

use super::command::{CommandError, CommandInfo, Protocol, classify};
use super::fis::{
    ControlFis, Fis, FisError, MAX_DATA_FIS_WORDS, PioSetup, RegH2d, SHADOW_FIS_WORDS,
    data_fis_header,
};
use super::regs::{ATA_CTL_SRST, ATA_SR_ERR, Register, RegisterError, Registers, TransportErrors};
use super::router::{DropReason, Routed, Router};

/// Transport states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    /// Register H2D FIS on the wire
    Command,
    PioInSetup,
    PioRxData,
    PioOutSetup,
    PioTxData,
    DmaIn,
    /// All DMA-in data arrived, waiting for the status FIS
    DmaInFinal,
    DmaOutSetup,
    DmaTxData,
    /// Waiting for the closing Register D2H or Set Device Bits FIS
    WaitReg,
}

/// How the last command ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub command: u8,
    pub status: u8,
    pub error: u8,
    /// Payload bytes moved
    pub bytes: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransportStats {
    pub commands: u32,
    pub completed: u32,
    pub retries: u32,
    pub data_fis_sent: u32,
}

/// Frame being handed to the link
enum Outgoing {
    None,
    Control {
        words: heapless::Vec<u32, SHADOW_FIS_WORDS>,
        next: usize,
    },
    Data {
        header_sent: bool,
        remaining: usize,
    },
}

/// Bookkeeping for the command in flight
#[derive(Debug, Clone, Copy)]
struct Transfer {
    command: u8,
    info: CommandInfo,
    total: u32,
    /// Bytes not yet moved
    remaining: u32,
    /// Bytes in the current data block
    block: u32,
    /// Ending status of a PIO data-in block
    e_status: u8,
}

impl Transfer {
    fn moved(&self) -> u32 {
        self.total - self.remaining
    }
}

pub struct Transport {
    config: TransportConfig,
    state: TransportState,
    regs: Registers,
    router: Router,
    mm2s: DmaChannel,
    s2mm: DmaChannel,
    outgoing: Outgoing,
    /// One of our frames is between its first beat and its verdict
    tx_busy: bool,
    /// Verdict that arrived before the frame was fully pushed
    early_verdict: Option<bool>,
    h2d: RegH2d,
    /// Device Control to send once the SRST FIS is out
    srst_release: Option<u8>,
    retries: u8,
    transfer: Option<Transfer>,
    completion: Option<Completion>,
    link_up: bool,
    stats: TransportStats,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            state: TransportState::Idle,
            regs: Registers::new(),
            router: Router::new(),
            mm2s: DmaChannel::new(DmaDirection::Mm2s),
            s2mm: DmaChannel::new(DmaDirection::S2mm),
            outgoing: Outgoing::None,
            tx_busy: false,
            early_verdict: None,
            h2d: RegH2d::default(),
            srst_release: None,
            retries: 0,
            transfer: None,
            completion: None,
            link_up: false,
            stats: TransportStats::default(),
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    /// No command in flight and nothing of ours on the link
    pub fn is_idle(&self) -> bool {
        self.state == TransportState::Idle && !self.tx_busy
    }

    pub fn link_up(&self) -> bool {
        self.link_up
    }

    pub fn registers(&self) -> &Registers {
        &self.regs
    }

    pub fn errors(&self) -> TransportErrors {
        self.regs.errors()
    }

    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Memory to device channel (engine side)
    pub fn mm2s_mut(&mut self) -> &mut DmaChannel {
        &mut self.mm2s
    }

    /// Device to memory channel (engine side)
    pub fn s2mm_mut(&mut self) -> &mut DmaChannel {
        &mut self.s2mm
    }

    /// Take the result of the last finished command
    pub fn take_completion(&mut self) -> Option<Completion> {
        self.completion.take()
    }

    /// Register read by byte offset
    pub fn read(&self, offset: u32) -> Result<u32, RegisterError> {
        Ok(self.regs.read(Register::try_from(offset)?))
    }

    /// Register write by byte offset; writing COMMAND issues the command
    pub fn write(&mut self, offset: u32, value: u32) -> Result<(), RegisterError> {
        match Register::try_from(offset)? {
            Register::Command => Ok(self.issue(value as u8)?),
            reg => self.regs.write(reg, value),
        }
    }

    /// Start a command from the current register contents
    pub fn issue(&mut self, command: u8) -> Result<(), CommandError> {
        if !self.link_up {
            log::warn!("XPORT: command {:#04x} with link down", command);
            return Err(CommandError::LinkDown);
        }
        if self.state != TransportState::Idle || self.regs.is_busy() || self.tx_busy {
            log::warn!("XPORT: command {:#04x} while {:?}", command, self.state);
            return Err(CommandError::Busy);
        }
        let Some(info) = classify(command) else {
            log::warn!("XPORT: unknown command {:#04x}", command);
            return Err(CommandError::UnknownCommand(command));
        };

        let total = info.transfer_len(self.regs.sector_count());
        let addr = self.regs.dma_addr();
        let channel = if info.protocol.is_read() {
            Some(&mut self.s2mm)
        } else if info.protocol.is_write() {
            Some(&mut self.mm2s)
        } else {
            None
        };
        if let Some(channel) = channel {
            channel
                .request(addr, total)
                .map_err(|_| CommandError::Busy)?;
        }

        self.regs.begin(command);
        self.h2d = RegH2d::command(
            command,
            self.regs.features(),
            self.regs.lba(),
            self.regs.sector_count(),
            self.regs.device(),
        );
        self.transfer = Some(Transfer {
            command,
            info,
            total,
            remaining: total,
            block: 0,
            e_status: 0,
        });
        self.retries = 0;
        self.completion = None;
        self.stats.commands += 1;
        log::info!(
            "XPORT: command {:#04x} {:?} lba {:#x} len {}",
            command,
            info.protocol,
            self.regs.lba(),
            total
        );
        self.send_control(self.h2d.to_dwords());
        self.enter(TransportState::Command);
        Ok(())
    }

    /// Software reset: drop the command in flight and everything queued,
    /// then pulse SRST in the device's Device Control register
    pub fn reset(&mut self, link: &mut Link) {
        log::info!("XPORT: reset in {:?}", self.state);
        if self.tx_busy {
            self.drop_outgoing(link);
            link.abort();
        }
        while link.rx_mut().pop().is_some() {}
        self.router.reset();
        self.mm2s.reset();
        self.s2mm.reset();
        self.transfer = None;
        self.regs.clear_busy();
        self.enter(TransportState::Idle);
        if self.link_up {
            let control = self.regs.control();
            self.send_control(RegH2d::control(control | ATA_CTL_SRST).to_dwords());
            self.srst_release = Some(control & !ATA_CTL_SRST);
        }
    }

    /// One clock: consume the link's events, feed its transmit side and
    /// drain its receive side
    pub fn step(&mut self, link: &mut Link, status: LinkStatus) {
        self.link_events(link, status);
        self.check_dma();
        self.tx_verdict(status);
        self.pump_tx(link);
        self.drain_rx(link);
    }

    fn enter(&mut self, state: TransportState) {
        if state != self.state {
            log::debug!("XPORT: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn link_events(&mut self, link: &mut Link, status: LinkStatus) {
        if status.contains(LinkStatus::LINK_UP) {
            log::info!("XPORT: link up");
            self.link_up = true;
        }
        if status.contains(LinkStatus::LINK_DOWN) {
            log::warn!("XPORT: link down in {:?}", self.state);
            self.link_up = false;
            self.regs.record(TransportErrors::LINK_DOWN);
            if self.state != TransportState::Idle {
                self.regs.abort();
                self.end_command(true);
            }
            while link.rx_mut().pop().is_some() {}
            self.router.reset();
            self.drop_outgoing(link);
        }
    }

    /// Forget our frame; a half-pushed payload is closed so the link stops
    /// swallowing beats
    fn drop_outgoing(&mut self, link: &mut Link) {
        link.tx_mut().abort();
        if self.outgoing_started() && link.tx_mut().push(Beat::new(0, true)).is_err() {
            log::warn!("XPORT: could not close aborted frame");
        }
        self.outgoing = Outgoing::None;
        self.tx_busy = false;
        self.early_verdict = None;
        self.srst_release = None;
    }

    /// Some beats of the frame being pushed are already with the link
    fn outgoing_started(&self) -> bool {
        match self.outgoing {
            Outgoing::None => false,
            Outgoing::Control { next, .. } => next > 0,
            Outgoing::Data { header_sent, .. } => header_sent,
        }
    }

    fn check_dma(&mut self) {
        for (channel, flag) in [
            (&self.mm2s, TransportErrors::MM2S),
            (&self.s2mm, TransportErrors::S2MM),
        ] {
            if channel.state() == DmaState::Error && !self.regs.errors().contains(flag) {
                log::warn!("XPORT: {:?} DMA error", channel.direction());
                self.regs.record(flag);
            }
        }
    }

    fn tx_verdict(&mut self, status: LinkStatus) {
        if !self.tx_busy {
            return;
        }
        let ok = if status.contains(LinkStatus::TX_SUCCESS) {
            true
        } else if status.contains(LinkStatus::TX_FAILED) {
            false
        } else {
            return;
        };
        if matches!(self.outgoing, Outgoing::None) {
            self.tx_busy = false;
            self.frame_done(ok);
        } else if !self.outgoing_started() {
            // Verdict for a frame dropped before this one was queued
            log::debug!("XPORT: verdict {} before our frame started, ignored", ok);
        } else {
            // Cut short; the rest of the frame still has to be pushed so the
            // link can discard it
            self.early_verdict = Some(ok);
        }
    }

    /// Our frame left the link with the given verdict
    fn frame_done(&mut self, ok: bool) {
        match (self.state, ok) {
            (TransportState::Command, true) => {
                let next = match self.transfer.map(|t| t.info.protocol) {
                    Some(Protocol::PioIn) => TransportState::PioInSetup,
                    Some(Protocol::PioOut) => TransportState::PioOutSetup,
                    Some(Protocol::DmaIn) => TransportState::DmaIn,
                    Some(Protocol::DmaOut) => TransportState::DmaOutSetup,
                    Some(Protocol::NonData) | None => TransportState::WaitReg,
                };
                self.enter(next);
            }
            (TransportState::Command, false) => {
                if self.retries < self.config.max_retries {
                    self.retries += 1;
                    self.stats.retries += 1;
                    log::warn!("XPORT: H2D failed, retry {}", self.retries);
                    self.send_control(self.h2d.to_dwords());
                } else {
                    log::error!("XPORT: H2D failed {} times, giving up", self.retries + 1);
                    self.regs.record(TransportErrors::TX_RETRY_EXHAUSTED);
                    self.regs.abort();
                    self.end_command(true);
                }
            }
            (TransportState::PioTxData, true) => {
                self.regs.set_drq(false);
                let done = self.retire_block();
                self.enter(if done {
                    TransportState::WaitReg
                } else {
                    TransportState::PioOutSetup
                });
            }
            (TransportState::DmaTxData, true) => {
                let done = self.retire_block();
                self.enter(if done {
                    TransportState::WaitReg
                } else {
                    TransportState::DmaOutSetup
                });
            }
            (TransportState::PioTxData | TransportState::DmaTxData, false) => {
                log::warn!("XPORT: Data FIS failed");
                self.regs.record(TransportErrors::DATA_FIS_FAILED);
                self.regs.set_drq(false);
                self.enter(TransportState::WaitReg);
            }
            (TransportState::Idle, ok) => match self.srst_release.take() {
                Some(control) => {
                    if !ok {
                        log::warn!("XPORT: SRST FIS not acknowledged");
                    }
                    self.send_control(RegH2d::control(control).to_dwords());
                }
                None => log::debug!("XPORT: control FIS done, ok {}", ok),
            },
            (state, ok) => {
                log::debug!("XPORT: stray frame verdict {} in {:?}", ok, state);
            }
        }
    }

    /// Count the current block as moved; true once nothing is left
    fn retire_block(&mut self) -> bool {
        match self.transfer.as_mut() {
            Some(t) => {
                t.remaining = t.remaining.saturating_sub(t.block);
                t.block = 0;
                t.remaining == 0
            }
            None => true,
        }
    }

    fn send_control(&mut self, words: heapless::Vec<u32, SHADOW_FIS_WORDS>) {
        self.outgoing = Outgoing::Control { words, next: 0 };
        self.tx_busy = true;
    }

    fn send_data(&mut self, bytes: u32) {
        self.outgoing = Outgoing::Data {
            header_sent: false,
            remaining: (bytes as usize).div_ceil(4),
        };
        self.tx_busy = true;
        self.stats.data_fis_sent += 1;
    }

    fn pump_tx(&mut self, link: &mut Link) {
        while link.tx().ready() {
            let (beat, finished) = match &mut self.outgoing {
                Outgoing::None => return,
                Outgoing::Control { words, next } => {
                    let last = *next + 1 >= words.len();
                    let beat = Beat::new(words[*next], last);
                    *next += 1;
                    (beat, last)
                }
                Outgoing::Data {
                    header_sent,
                    remaining,
                } => {
                    if !*header_sent {
                        *header_sent = true;
                        let last = *remaining == 0;
                        (Beat::new(data_fis_header(0), last), last)
                    } else {
                        let Some(word) = self.mm2s.pop() else {
                            return;
                        };
                        *remaining = remaining.saturating_sub(1);
                        let last = *remaining == 0;
                        (Beat::new(word.data.swap_bytes(), last), last)
                    }
                }
            };
            if link.tx_mut().push(beat).is_err() {
                log::error!("XPORT: link refused a beat it reported room for");
                return;
            }
            if finished {
                self.outgoing = Outgoing::None;
                if let Some(ok) = self.early_verdict.take() {
                    self.tx_busy = false;
                    self.frame_done(ok);
                }
                return;
            }
        }
    }

    fn drain_rx(&mut self, link: &mut Link) {
        // Payload only moves while the memory side can take it
        while self.s2mm.can_push() {
            let Some(beat) = link.rx_mut().pop() else {
                return;
            };
            match self.router.route(beat) {
                Routed::Pending => {}
                Routed::Data(word) => self.on_data(word),
                Routed::Control(fis) => self.on_control(fis),
                Routed::Dropped(reason) => self.on_dropped(reason),
            }
        }
    }

    fn on_dropped(&mut self, reason: DropReason) {
        let flag = match reason {
            DropReason::Aborted => TransportErrors::RX_ABORT,
            DropReason::Malformed(FisError::UnknownType(_)) => {
                TransportErrors::UNKNOWN_FIS
            }
            DropReason::Overlong | DropReason::Malformed(_) => TransportErrors::MALFORMED_FIS,
        };
        self.regs.record(flag);
    }

    fn on_data(&mut self, word: DmaWord) {
        if !matches!(self.state, TransportState::PioRxData | TransportState::DmaIn) {
            log::warn!("XPORT: Data FIS in {:?} dropped", self.state);
            return;
        }
        // The closing beat of an aborted frame carries no payload
        if !(word.last && word.abort) {
            if let Some(t) = self.transfer.as_mut() {
                t.remaining = t.remaining.saturating_sub(4);
                t.block = t.block.saturating_sub(4);
            }
        } else {
            self.regs.record(TransportErrors::RX_ABORT);
        }
        if self.s2mm.push(word).is_err() {
            log::error!("XPORT: S2MM refused a word it reported room for");
        }
        if !word.last {
            return;
        }
        let remaining = self.transfer.map_or(0, |t| t.remaining);
        match self.state {
            TransportState::PioRxData => {
                self.regs.set_drq(false);
                if remaining == 0 {
                    let e_status = self.transfer.map_or(0, |t| t.e_status);
                    let error = self.regs.error();
                    self.regs.finish(e_status, error);
                    self.end_command(false);
                } else {
                    self.enter(TransportState::PioInSetup);
                }
            }
            _ => {
                if remaining == 0 {
                    self.enter(TransportState::DmaInFinal);
                }
            }
        }
    }

    fn on_control(&mut self, fis: ControlFis) {
        match fis {
            ControlFis::RegD2h(d2h) => {
                if self.state == TransportState::Command {
                    // The device cannot answer a command it has not received
                    log::warn!("XPORT: D2H before the command was delivered, dropped");
                    return;
                }
                self.regs.publish_d2h(&d2h);
                if self.state == TransportState::Idle {
                    log::info!(
                        "XPORT: D2H status {:#04x} signature {:#010x}",
                        d2h.status,
                        self.regs.signature()
                    );
                } else {
                    self.end_command(d2h.status & ATA_SR_ERR != 0);
                }
            }
            ControlFis::SetDeviceBits(sdb) => {
                self.regs.publish_sdb(&sdb);
                if matches!(
                    self.state,
                    TransportState::WaitReg | TransportState::DmaInFinal
                ) {
                    self.regs.clear_busy();
                    self.end_command(sdb.status & ATA_SR_ERR != 0);
                }
            }
            ControlFis::PioSetup(setup) => self.on_pio_setup(&setup),
            ControlFis::DmaActivate(_) => {
                if self.state == TransportState::DmaOutSetup {
                    let block = self
                        .transfer
                        .map_or(0, |t| t.remaining.min((MAX_DATA_FIS_WORDS * 4) as u32));
                    if block == 0 {
                        log::warn!("XPORT: DMA Activate with nothing left to send");
                        self.regs.record(TransportErrors::MALFORMED_FIS);
                        return;
                    }
                    self.begin_block(block);
                    self.send_data(block);
                    self.enter(TransportState::DmaTxData);
                } else {
                    log::warn!("XPORT: DMA Activate in {:?} ignored", self.state);
                }
            }
            ControlFis::DmaSetup(setup) => {
                log::debug!("XPORT: DMA Setup {:?} ignored", setup);
            }
            ControlFis::RegH2d(_) => {
                log::warn!("XPORT: host-to-device FIS received");
                self.regs.record(TransportErrors::UNKNOWN_FIS);
            }
        }
    }

    fn on_pio_setup(&mut self, setup: &PioSetup) {
        let count = u32::from(setup.transfer_count.get());
        match (self.state, setup.to_host()) {
            (TransportState::PioInSetup, true) => {
                self.regs.publish_pio_setup(setup);
                self.begin_block(count);
                if let Some(t) = self.transfer.as_mut() {
                    t.e_status = setup.e_status;
                }
                self.enter(TransportState::PioRxData);
            }
            (TransportState::PioOutSetup, false) => {
                let block = self.transfer.map_or(0, |t| t.remaining.min(count));
                if block == 0 {
                    log::warn!("XPORT: PIO Setup for an empty data-out block");
                    self.regs.record(TransportErrors::MALFORMED_FIS);
                    return;
                }
                self.regs.publish_pio_setup(setup);
                self.begin_block(block);
                self.send_data(block);
                self.enter(TransportState::PioTxData);
            }
            (state, to_host) => {
                log::warn!("XPORT: PIO Setup (to host {}) in {:?} ignored", to_host, state);
            }
        }
    }

    fn begin_block(&mut self, bytes: u32) {
        if let Some(t) = self.transfer.as_mut() {
            t.block = bytes;
        }
    }

    /// Leave the command; `failed` also tears down the DMA request
    fn end_command(&mut self, failed: bool) {
        if let Some(t) = self.transfer.take() {
            let moved = t.moved();
            self.regs.advance_dma_addr(moved);
            self.completion = Some(Completion {
                command: t.command,
                status: self.regs.status(),
                error: self.regs.error(),
                bytes: moved,
            });
            log::info!(
                "XPORT: command {:#04x} done, status {:#04x} error {:#04x}, {} bytes",
                t.command,
                self.regs.status(),
                self.regs.error(),
                moved
            );
        }
        if failed || self.mm2s.state() == DmaState::Error {
            self.mm2s.reset();
        }
        if failed || self.s2mm.state() == DmaState::Error {
            self.s2mm.reset();
        }
        if matches!(self.outgoing, Outgoing::None) {
            self.tx_busy = false;
        }
        self.stats.completed += 1;
        self.enter(TransportState::Idle);
    }
}
