//! Host port
//!
//! Wires one [`Link`] and one [`Transport`] together and runs them against a
//! [`Phy`], one word in and one word out per step. [`MemoryDma`] plays the
//! external DMA engine over a byte slice standing in for host memory.

use crate::config::{LinkConfig, TransportConfig};
use crate::dma::{DmaChannel, DmaState, DmaWord};
use crate::link::{Link, LinkStatus, Word};
use crate::logger;
use crate::phy::Phy;
use crate::transport::regs::ATA_SR_DRDY;
use crate::transport::{RegisterError, Transport};

/// Link and transport of the host side of a cable
pub struct HostPort {
    link: Link,
    transport: Transport,
    /// Word the serializer refused; the link stalls until it is taken
    held: Option<Word>,
    cycle: u64,
}

impl HostPort {
    pub fn new(link: LinkConfig, transport: TransportConfig) -> Self {
        Self {
            link: Link::new(link),
            transport: Transport::new(transport),
            held: None,
            cycle: 0,
        }
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    /// Steps run so far
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Link up, transport idle and the device has reported DRDY
    pub fn is_ready(&self) -> bool {
        let regs = self.transport.registers();
        self.transport.link_up()
            && self.transport.is_idle()
            && !regs.is_busy()
            && regs.status() & ATA_SR_DRDY != 0
    }

    pub fn read(&self, offset: u32) -> Result<u32, RegisterError> {
        self.transport.read(offset)
    }

    pub fn write(&mut self, offset: u32, value: u32) -> Result<(), RegisterError> {
        self.transport.write(offset, value)
    }

    /// Software reset of the transport
    pub fn reset(&mut self) {
        self.transport.reset(&mut self.link);
    }

    /// One clock across the whole port
    pub fn step<P: Phy>(&mut self, phy: &mut P) -> LinkStatus {
        logger::set_cycle(self.cycle);
        self.cycle += 1;

        if let Some(word) = phy.recv() {
            self.link.receive(word);
        }
        if let Some(word) = self.held.take() {
            if let Err(word) = phy.send(word) {
                self.held = Some(word);
                self.transport.step(&mut self.link, LinkStatus::empty());
                return LinkStatus::empty();
            }
        }
        let out = self.link.step(phy.link_ready());
        if let Err(word) = phy.send(out.word) {
            log::debug!("PHY: serializer full, stalling on {:?}", word);
            self.held = Some(word);
        }
        if out.phy_reset_request() {
            phy.request_reset();
        }
        self.transport.step(&mut self.link, out.status);
        out.status
    }
}

/// One engine-side transfer
#[derive(Debug, Clone, Copy)]
struct Job {
    addr: usize,
    len: usize,
    done: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DmaStats {
    pub read: u64,
    pub written: u64,
    pub faults: u32,
}

/// DMA engine over a byte slice
///
/// Words travel as big-endian byte groups so memory holds the wire's byte
/// order once the transport has swapped each dword.
pub struct MemoryDma<'a> {
    memory: &'a mut [u8],
    mm2s: Option<Job>,
    s2mm: Option<Job>,
    stats: DmaStats,
}

impl<'a> MemoryDma<'a> {
    pub fn new(memory: &'a mut [u8]) -> Self {
        Self {
            memory,
            mm2s: None,
            s2mm: None,
            stats: DmaStats::default(),
        }
    }

    pub fn memory(&self) -> &[u8] {
        &*self.memory
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut *self.memory
    }

    pub fn stats(&self) -> DmaStats {
        self.stats
    }

    /// Service both channels of a transport for one step
    pub fn service(&mut self, transport: &mut Transport) {
        let memory_len = self.memory.len();
        Self::accept(transport.mm2s_mut(), &mut self.mm2s, memory_len, &mut self.stats);
        Self::accept(transport.s2mm_mut(), &mut self.s2mm, memory_len, &mut self.stats);
        self.feed(transport.mm2s_mut());
        self.drain(transport.s2mm_mut());
    }

    fn accept(
        channel: &mut DmaChannel,
        job: &mut Option<Job>,
        memory_len: usize,
        stats: &mut DmaStats,
    ) {
        if matches!(channel.state(), DmaState::Idle | DmaState::Error) {
            *job = None;
        }
        let Ok((addr, len)) = channel.accept() else {
            return;
        };
        let addr = addr as usize;
        let len = len as usize;
        match addr.checked_add(len) {
            Some(end) if end <= memory_len && len % 4 == 0 => {
                *job = Some(Job { addr, len, done: 0 });
            }
            _ => {
                log::warn!(
                    "DMA: {:?} request {:#x} + {} outside memory",
                    channel.direction(),
                    addr,
                    len
                );
                stats.faults += 1;
                channel.fail();
            }
        }
    }

    fn feed(&mut self, channel: &mut DmaChannel) {
        let Some(job) = self.mm2s.as_mut() else {
            return;
        };
        while job.done < job.len && channel.can_push() {
            let at = job.addr + job.done;
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&self.memory[at..at + 4]);
            if channel.push(DmaWord::new(u32::from_be_bytes(bytes))).is_err() {
                break;
            }
            job.done += 4;
            self.stats.read += 4;
        }
        if job.done == job.len {
            self.mm2s = None;
            if channel.complete().is_err() {
                log::warn!("DMA: MM2S completion without a transfer");
            }
        }
    }

    fn drain(&mut self, channel: &mut DmaChannel) {
        let Some(job) = self.s2mm.as_mut() else {
            return;
        };
        while let Some(word) = channel.pop() {
            if word.last && word.abort {
                log::warn!("DMA: S2MM frame aborted after {} bytes", job.done);
                continue;
            }
            if job.done >= job.len {
                log::warn!("DMA: S2MM overrun, dropping {:#010x}", word.data);
                continue;
            }
            let at = job.addr + job.done;
            self.memory[at..at + 4].copy_from_slice(&word.data.to_be_bytes());
            job.done += 4;
            self.stats.written += 4;
        }
        if job.done == job.len {
            self.s2mm = None;
            if channel.complete().is_err() {
                log::warn!("DMA: S2MM completion without a transfer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::DmaDirection;
    use crate::link::Primitive;

    /// PHY whose serializer refuses everything while choked
    #[derive(Default)]
    struct Choke {
        choked: bool,
        sent: Vec<Word>,
        refused: Vec<Word>,
    }

    impl Phy for Choke {
        fn link_ready(&self) -> bool {
            true
        }

        fn send(&mut self, word: Word) -> Result<(), Word> {
            if self.choked {
                self.refused.push(word);
                Err(word)
            } else {
                self.sent.push(word);
                Ok(())
            }
        }

        fn recv(&mut self) -> Option<Word> {
            None
        }

        fn request_reset(&mut self) {}
    }

    #[test]
    fn refused_word_stalls_the_link() {
        let quiet = LinkConfig::new().with_align_interval(None);
        let mut port = HostPort::new(quiet, TransportConfig::new());
        let mut phy = Choke::default();
        port.step(&mut phy);

        phy.choked = true;
        for _ in 0..4 {
            assert!(!port.step(&mut phy).contains(LinkStatus::LINK_UP));
        }
        // One word from the link, offered again on every choked step
        let align: Word = Primitive::Align.into();
        assert_eq!(phy.refused, vec![align; 4]);

        phy.choked = false;
        assert!(port.step(&mut phy).contains(LinkStatus::LINK_UP));
        assert_eq!(phy.sent, vec![align, align, Primitive::Sync.into()]);
    }

    #[test]
    fn mm2s_reads_memory_in_order() {
        let mut memory = [0u8; 16];
        memory[4..12].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut dma = MemoryDma::new(&mut memory);
        let mut ch = DmaChannel::new(DmaDirection::Mm2s);
        ch.request(4, 8).unwrap();

        let mut job = None;
        let mut stats = DmaStats::default();
        MemoryDma::accept(&mut ch, &mut job, 16, &mut stats);
        dma.mm2s = job;
        dma.feed(&mut ch);

        assert!(ch.is_idle());
        assert_eq!(ch.pop().map(|w| w.data), Some(0x0102_0304));
        assert_eq!(ch.pop().map(|w| w.data), Some(0x0506_0708));
        assert_eq!(dma.stats().read, 8);
    }

    #[test]
    fn s2mm_writes_and_completes() {
        let mut memory = [0u8; 8];
        let mut dma = MemoryDma::new(&mut memory);
        let mut ch = DmaChannel::new(DmaDirection::S2mm);
        ch.request(0, 8).unwrap();
        let mut job = None;
        let mut stats = DmaStats::default();
        MemoryDma::accept(&mut ch, &mut job, 8, &mut stats);
        dma.s2mm = job;

        ch.push(DmaWord::new(0xDEAD_BEEF)).unwrap();
        dma.drain(&mut ch);
        assert!(!ch.is_idle());
        ch.push(DmaWord::new(0x0011_2233)).unwrap();
        dma.drain(&mut ch);
        assert!(ch.is_idle());
        assert_eq!(dma.memory(), &[0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x11, 0x22, 0x33]);
    }

    #[test]
    fn out_of_range_request_fails_channel() {
        let mut ch = DmaChannel::new(DmaDirection::S2mm);
        ch.request(0x100, 512).unwrap();
        let mut job = None;
        let mut stats = DmaStats::default();
        MemoryDma::accept(&mut ch, &mut job, 256, &mut stats);
        assert!(job.is_none());
        assert_eq!(ch.state(), DmaState::Error);
        assert_eq!(stats.faults, 1);
    }
}
