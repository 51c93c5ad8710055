//! Link layer state machine
//!
//! Drives the primitive handshake with the far end: idle/sync, transmit
//! request and grant, receive accept, HOLD flow control and the R_OK/R_ERR
//! verdict exchange. One call to [`Link::receive`] per incoming word runs the
//! receive side; one call to [`Link::step`] per clock runs the transmit side
//! and produces exactly one outgoing word.
//!
//! Priority inside a step is fixed: loss of PHY ready, then an abort request
//! from above, then the protocol transitions of the current state, then the
//! state's default (stay and repeat its primitive).
//!
//! Reference: Serial ATA Revision 3.x, 9.6 "Link layer state diagrams".

use crate::config::{LinkConfig, Role};

use super::cont::{ContDecoder, ContEncoder, Encoded};
use super::primitive::{Primitive, Word, WordKind};
use super::rx::{RxPipeline, RxVerdict};
use super::tx::TxPipeline;

bitflags::bitflags! {
    /// Events raised by one [`Link::step`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LinkStatus: u16 {
        /// Far end acknowledged our frame with R_OK
        const TX_SUCCESS = 1 << 0;
        /// Our frame was aborted, rejected with R_ERR or cut by SYNC
        const TX_FAILED = 1 << 1;
        /// A received frame passed its CRC check
        const RX_GOOD_END = 1 << 2;
        /// A received frame failed or was aborted
        const RX_BAD_END = 1 << 3;
        /// Handshake finished, link idle
        const LINK_UP = 1 << 4;
        /// PHY ready dropped
        const LINK_DOWN = 1 << 5;
        /// Ask the PHY to rerun its out-of-band sequence
        const PHY_RESET_REQUEST = 1 << 6;
        /// The receive FIFO refused a dword; the frame was discarded
        const RX_OVERFLOW = 1 << 7;
    }
}

/// Link states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Reset,
    NoComm,
    NoCommErr,
    SendAlign,
    Idle,
    SyncEscape,
    PmDeny,
    // Transmit path
    SendChkRdy,
    SendData,
    RcvrHold,
    Wait,
    // Receive path
    RcvWaitFifo,
    RcvChkRdy,
    RcvData,
    Hold,
    RcvHold,
    RcvEof,
    GoodEnd,
    BadEnd,
}

/// Which way the current exchange runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Transmit,
    Receive,
}

impl LinkState {
    /// Direction implied by the state, if any
    pub fn direction(self) -> Option<Direction> {
        match self {
            LinkState::SendChkRdy | LinkState::SendData | LinkState::RcvrHold | LinkState::Wait => {
                Some(Direction::Transmit)
            }
            LinkState::RcvWaitFifo
            | LinkState::RcvChkRdy
            | LinkState::RcvData
            | LinkState::Hold
            | LinkState::RcvHold
            | LinkState::RcvEof
            | LinkState::GoodEnd
            | LinkState::BadEnd => Some(Direction::Receive),
            _ => None,
        }
    }

    /// States in which the physical link is not yet (or no longer) usable
    pub fn is_down(self) -> bool {
        matches!(self, LinkState::Reset | LinkState::NoComm | LinkState::NoCommErr)
    }
}

/// Last thing seen from the far end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remote {
    Nothing,
    Data,
    Primitive(Primitive),
}

impl Remote {
    fn is(self, prim: Primitive) -> bool {
        self == Remote::Primitive(prim)
    }
}

/// What one [`Link::step`] put on the wire and reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkOutput {
    pub word: Word,
    pub status: LinkStatus,
}

impl LinkOutput {
    /// The PHY should rerun its out-of-band handshake
    pub fn phy_reset_request(&self) -> bool {
        self.status.contains(LinkStatus::PHY_RESET_REQUEST)
    }
}

/// Periodic ALIGN pair insertion
struct AlignInserter {
    interval: Option<u16>,
    sent: u16,
    owed: u8,
}

impl AlignInserter {
    fn new(interval: Option<u16>) -> Self {
        Self {
            interval,
            sent: 0,
            owed: 0,
        }
    }

    /// Whether this step belongs to an ALIGN pair
    fn due(&mut self) -> bool {
        if self.owed > 0 {
            self.owed -= 1;
            return true;
        }
        match self.interval {
            Some(interval) if self.sent >= interval => {
                self.sent = 0;
                self.owed = 1;
                true
            }
            _ => false,
        }
    }

    fn count(&mut self) {
        self.sent = self.sent.saturating_add(1);
    }

    fn reset(&mut self) {
        self.sent = 0;
        self.owed = 0;
    }
}

/// Link session counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkStats {
    pub tx_ok: u32,
    pub tx_failed: u32,
    pub rx_good: u32,
    pub rx_bad: u32,
    pub sync_escapes: u32,
}

/// One end of a SATA link
pub struct Link {
    config: LinkConfig,
    state: LinkState,
    direction: Option<Direction>,
    remote: Remote,
    tx: TxPipeline,
    rx: RxPipeline,
    cont_tx: ContEncoder,
    cont_rx: ContDecoder,
    align: AlignInserter,
    /// Word displaced by a CONT run terminator
    pending: Option<Word>,
    abort_request: bool,
    overflows_seen: u32,
    stats: LinkStats,
}

impl Link {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            state: LinkState::Reset,
            direction: None,
            remote: Remote::Nothing,
            tx: TxPipeline::new(config.scrambling),
            rx: RxPipeline::new(config.scrambling),
            cont_tx: ContEncoder::new(config.cont),
            cont_rx: ContDecoder::new(),
            align: AlignInserter::new(config.align_interval),
            pending: None,
            abort_request: false,
            overflows_seen: 0,
            stats: LinkStats::default(),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Direction of the exchange in progress
    pub fn direction(&self) -> Option<Direction> {
        self.direction
    }

    /// Last primitive (or data) observed from the far end
    pub fn remote(&self) -> Remote {
        self.remote
    }

    /// Handshake complete and PHY ready
    pub fn is_up(&self) -> bool {
        !self.state.is_down() && self.state != LinkState::SendAlign
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn tx(&self) -> &TxPipeline {
        &self.tx
    }

    /// Payload input (transport → link)
    pub fn tx_mut(&mut self) -> &mut TxPipeline {
        &mut self.tx
    }

    pub fn rx(&self) -> &RxPipeline {
        &self.rx
    }

    /// Payload output (link → transport)
    pub fn rx_mut(&mut self) -> &mut RxPipeline {
        &mut self.rx
    }

    /// Request an abort of the current exchange; sampled on the next step
    pub fn abort(&mut self) {
        self.abort_request = true;
    }

    /// Return to `Reset`, dropping everything in flight
    pub fn reset(&mut self) {
        self.tx.abort();
        self.rx.abort();
        self.cont_tx.reset();
        self.cont_rx.reset();
        self.align.reset();
        self.pending = None;
        self.abort_request = false;
        self.remote = Remote::Nothing;
        self.enter(LinkState::Reset);
    }

    /// Receive side: take one word from the PHY
    pub fn receive(&mut self, word: Word) {
        #[cfg(feature = "trace-words")]
        log::trace!("LINK: rx {:?}", word);

        let Some(word) = self.cont_rx.decode(word) else {
            return;
        };
        match word.kind() {
            WordKind::Data(_) => self.remote = Remote::Data,
            WordKind::Primitive(Primitive::Align) => {}
            WordKind::Primitive(prim) => self.remote = Remote::Primitive(prim),
            WordKind::Unknown(_) => {}
        }
        self.rx.step(word);
    }

    /// Transmit side: advance one clock and produce the outgoing word
    pub fn step(&mut self, phy_ready: bool) -> LinkOutput {
        let mut status = LinkStatus::empty();
        self.tx.advance();

        let word = if !phy_ready && !self.state.is_down() {
            self.link_lost(&mut status);
            Primitive::Align.into()
        } else if self.abort_request && !self.state.is_down() {
            self.abort_request = false;
            self.escape(&mut status);
            self.encode(Primitive::Sync.into())
        } else if let Some(word) = self.pending.take() {
            self.encode(word)
        } else if self.is_up() && self.align.due() {
            Primitive::Align.into()
        } else {
            let word = self.transition(phy_ready, &mut status);
            self.encode(word)
        };

        if self.is_up() && word != Primitive::Align.into() {
            self.align.count();
        }

        let overflows = self.rx.stats().overflows;
        if overflows != self.overflows_seen {
            self.overflows_seen = overflows;
            status.insert(LinkStatus::RX_OVERFLOW);
        }

        #[cfg(feature = "trace-words")]
        log::trace!("LINK: tx {:?}", word);

        self.account(status);
        LinkOutput { word, status }
    }

    /// Run the CONT encoder over a word chosen by the state machine
    fn encode(&mut self, word: Word) -> Word {
        match self.cont_tx.encode(word) {
            Encoded::Send(w) => w,
            Encoded::Terminate(w) => {
                self.pending = Some(word);
                w
            }
        }
    }

    fn account(&mut self, status: LinkStatus) {
        if status.contains(LinkStatus::TX_SUCCESS) {
            self.stats.tx_ok += 1;
        }
        if status.contains(LinkStatus::TX_FAILED) {
            self.stats.tx_failed += 1;
        }
        if status.contains(LinkStatus::RX_GOOD_END) {
            self.stats.rx_good += 1;
        }
        if status.contains(LinkStatus::RX_BAD_END) {
            self.stats.rx_bad += 1;
        }
    }

    fn enter(&mut self, next: LinkState) {
        if next != self.state {
            log::debug!("LINK: {:?} -> {:?}", self.state, next);
            self.state = next;
            if next != LinkState::SyncEscape {
                self.direction = next.direction();
            }
        }
    }

    /// Report the exchange in progress as failed
    fn fail_exchange(&mut self, status: &mut LinkStatus) {
        match self.state.direction() {
            Some(Direction::Transmit) => {
                self.tx.abort();
                status.insert(LinkStatus::TX_FAILED);
            }
            Some(Direction::Receive) => {
                self.rx.abort();
                status.insert(LinkStatus::RX_BAD_END);
            }
            None => {}
        }
    }

    fn link_lost(&mut self, status: &mut LinkStatus) {
        log::warn!("LINK: PHY not ready in {:?}", self.state);
        if self.state.direction() == Some(Direction::Transmit) || self.tx.has_frame() {
            self.tx.abort();
            status.insert(LinkStatus::TX_FAILED);
        }
        if self.state.direction() == Some(Direction::Receive) {
            status.insert(LinkStatus::RX_BAD_END);
        }
        self.rx.abort();
        self.cont_tx.reset();
        self.cont_rx.reset();
        self.align.reset();
        self.pending = None;
        self.abort_request = false;
        self.remote = Remote::Nothing;
        status.insert(LinkStatus::LINK_DOWN | LinkStatus::PHY_RESET_REQUEST);
        self.enter(LinkState::NoCommErr);
    }

    fn escape(&mut self, status: &mut LinkStatus) {
        log::warn!("LINK: abort requested in {:?}", self.state);
        self.fail_exchange(status);
        self.pending = None;
        self.stats.sync_escapes += 1;
        self.enter(LinkState::SyncEscape);
    }

    /// Room to accept a frame
    fn rx_ready(&self) -> bool {
        self.rx.free() >= self.config.rx_hold_threshold
    }

    /// Receive-path entry on X_RDY
    fn accept_frame(&self) -> (LinkState, Word) {
        if self.rx_ready() {
            (LinkState::RcvChkRdy, Primitive::RRdy.into())
        } else {
            (LinkState::RcvWaitFifo, Primitive::Sync.into())
        }
    }

    /// EOF processed on the receive side, verdict waiting
    fn frame_ended(&self) -> bool {
        !self.rx.in_frame() && self.rx.verdict_pending()
    }

    fn transition(&mut self, phy_ready: bool, status: &mut LinkStatus) -> Word {
        let sync: Word = Primitive::Sync.into();
        let remote = self.remote;

        let (next, word) = match self.state {
            LinkState::Reset => (LinkState::NoComm, Primitive::Align.into()),
            LinkState::NoComm => {
                if phy_ready {
                    (LinkState::SendAlign, Primitive::Align.into())
                } else {
                    (LinkState::NoComm, Primitive::Align.into())
                }
            }
            LinkState::NoCommErr => (LinkState::NoComm, Primitive::Align.into()),
            LinkState::SendAlign => {
                log::info!("LINK: up");
                status.insert(LinkStatus::LINK_UP);
                (LinkState::Idle, sync)
            }
            LinkState::Idle => {
                // Verdicts of frames that died outside the receive path
                let _ = self.rx.take_verdict();
                if self.tx.has_frame() {
                    (LinkState::SendChkRdy, Primitive::XRdy.into())
                } else if remote.is(Primitive::XRdy) {
                    self.accept_frame()
                } else if remote.is(Primitive::PmReqP) || remote.is(Primitive::PmReqS) {
                    log::debug!("LINK: denying power management request");
                    (LinkState::PmDeny, Primitive::PmNak.into())
                } else {
                    (LinkState::Idle, sync)
                }
            }
            LinkState::SyncEscape => {
                if remote.is(Primitive::Sync) || remote.is(Primitive::XRdy) {
                    (LinkState::Idle, sync)
                } else {
                    (LinkState::SyncEscape, sync)
                }
            }
            LinkState::PmDeny => {
                if remote.is(Primitive::PmReqP) || remote.is(Primitive::PmReqS) {
                    (LinkState::PmDeny, Primitive::PmNak.into())
                } else {
                    (LinkState::Idle, sync)
                }
            }

            // Transmit path
            LinkState::SendChkRdy => {
                if !self.tx.has_frame() {
                    (LinkState::Idle, sync)
                } else if remote.is(Primitive::XRdy) && self.config.role == Role::Host {
                    log::debug!("LINK: X_RDY collision, yielding to device");
                    self.accept_frame()
                } else if remote.is(Primitive::RRdy) {
                    match self.tx.pull() {
                        Some(word) => (LinkState::SendData, word),
                        None => (LinkState::Idle, sync),
                    }
                } else {
                    (LinkState::SendChkRdy, Primitive::XRdy.into())
                }
            }
            LinkState::SendData | LinkState::RcvrHold => {
                if remote.is(Primitive::Sync) {
                    log::warn!("LINK: frame cut by SYNC");
                    self.tx.abort();
                    status.insert(LinkStatus::TX_FAILED);
                    (LinkState::Idle, sync)
                } else if remote.is(Primitive::Hold) {
                    (LinkState::RcvrHold, Primitive::HoldA.into())
                } else {
                    match self.tx.pull() {
                        Some(word) if word == Primitive::Eof.into() => (LinkState::Wait, word),
                        Some(word) => (LinkState::SendData, word),
                        None => {
                            status.insert(LinkStatus::TX_FAILED);
                            (LinkState::Idle, sync)
                        }
                    }
                }
            }
            LinkState::Wait => {
                if remote.is(Primitive::ROk) {
                    status.insert(LinkStatus::TX_SUCCESS);
                    (LinkState::Idle, sync)
                } else if remote.is(Primitive::RErr) {
                    log::warn!("LINK: far end rejected frame (R_ERR)");
                    status.insert(LinkStatus::TX_FAILED);
                    (LinkState::Idle, sync)
                } else if remote.is(Primitive::Sync) {
                    log::warn!("LINK: SYNC while waiting for frame verdict");
                    status.insert(LinkStatus::TX_FAILED);
                    (LinkState::Idle, sync)
                } else {
                    (LinkState::Wait, Primitive::Wtrm.into())
                }
            }

            // Receive path
            LinkState::RcvWaitFifo => {
                if !remote.is(Primitive::XRdy) {
                    (LinkState::Idle, sync)
                } else {
                    self.accept_frame()
                }
            }
            LinkState::RcvChkRdy => {
                if self.rx.in_frame() || self.frame_ended() {
                    (LinkState::RcvData, Primitive::RIp.into())
                } else if remote.is(Primitive::XRdy) {
                    (LinkState::RcvChkRdy, Primitive::RRdy.into())
                } else {
                    (LinkState::Idle, sync)
                }
            }
            LinkState::RcvData | LinkState::Hold | LinkState::RcvHold => {
                self.receive_transition(status)
            }
            LinkState::RcvEof => match self.rx.take_verdict() {
                Some(RxVerdict::Good) => {
                    status.insert(LinkStatus::RX_GOOD_END);
                    (LinkState::GoodEnd, Primitive::ROk.into())
                }
                Some(RxVerdict::Bad) => {
                    status.insert(LinkStatus::RX_BAD_END);
                    (LinkState::BadEnd, Primitive::RErr.into())
                }
                None if remote.is(Primitive::Sync) => {
                    status.insert(LinkStatus::RX_BAD_END);
                    (LinkState::Idle, sync)
                }
                None => (LinkState::RcvEof, Primitive::RIp.into()),
            },
            LinkState::GoodEnd => {
                if remote.is(Primitive::Wtrm) || remote.is(Primitive::Eof) {
                    (LinkState::GoodEnd, Primitive::ROk.into())
                } else {
                    (LinkState::Idle, sync)
                }
            }
            LinkState::BadEnd => {
                if remote.is(Primitive::Wtrm) || remote.is(Primitive::Eof) {
                    (LinkState::BadEnd, Primitive::RErr.into())
                } else {
                    (LinkState::Idle, sync)
                }
            }
        };

        self.enter(next);
        word
    }

    /// Shared transitions of RcvData, Hold and RcvHold
    fn receive_transition(&mut self, status: &mut LinkStatus) -> (LinkState, Word) {
        let remote = self.remote;
        if remote.is(Primitive::Sync) {
            log::warn!("LINK: incoming frame aborted by SYNC");
            self.rx.abort();
            status.insert(LinkStatus::RX_BAD_END);
            return (LinkState::Idle, Primitive::Sync.into());
        }
        if self.frame_ended() {
            return (LinkState::RcvEof, Primitive::RIp.into());
        }
        if remote.is(Primitive::Wtrm) {
            log::warn!("LINK: WTRM without EOF");
            self.rx.abort();
            status.insert(LinkStatus::RX_BAD_END);
            return (LinkState::BadEnd, Primitive::RErr.into());
        }
        if !self.rx_ready() {
            return (LinkState::Hold, Primitive::Hold.into());
        }
        if remote.is(Primitive::Hold) {
            return (LinkState::RcvHold, Primitive::HoldA.into());
        }
        (LinkState::RcvData, Primitive::RIp.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::crc::frame_crc;
    use crate::link::rx::RxBeat;
    use crate::link::tx::Beat;
    use proptest::prelude::*;

    fn quiet() -> LinkConfig {
        LinkConfig::new().with_align_interval(None)
    }

    /// Bring a link to Idle against a silent far end
    fn up(link: &mut Link) -> LinkStatus {
        let mut seen = LinkStatus::empty();
        for _ in 0..3 {
            seen |= link.step(true).status;
        }
        assert_eq!(link.state(), LinkState::Idle);
        seen
    }

    fn push_frame(link: &mut Link, payload: &[u32]) {
        for (i, &w) in payload.iter().enumerate() {
            link.tx_mut()
                .push(Beat::new(w, i + 1 == payload.len()))
                .unwrap();
        }
    }

    /// Two links wired back to back
    struct Pair {
        host: Link,
        dev: Link,
    }

    impl Pair {
        fn new(host: LinkConfig, dev: LinkConfig) -> Self {
            Self {
                host: Link::new(host),
                dev: Link::new(dev.with_role(Role::Device)),
            }
        }

        fn tick(&mut self) -> (LinkStatus, LinkStatus) {
            let h = self.host.step(true);
            let d = self.dev.step(true);
            self.host.receive(d.word);
            self.dev.receive(h.word);
            (h.status, d.status)
        }
    }

    fn drain(rx: &mut RxPipeline, into: &mut Vec<RxBeat>) {
        while let Some(beat) = rx.pop() {
            into.push(beat);
        }
    }

    #[test]
    fn bring_up_reports_link_up_once() {
        let mut link = Link::new(quiet());
        assert_eq!(link.state(), LinkState::Reset);
        let status = up(&mut link);
        assert!(status.contains(LinkStatus::LINK_UP));
        assert!(link.is_up());
        for _ in 0..10 {
            let out = link.step(true);
            assert!(out.status.is_empty());
            assert_eq!(out.word, Primitive::Sync.into());
        }
    }

    #[test]
    fn no_comm_waits_for_phy() {
        let mut link = Link::new(quiet());
        link.step(false);
        for _ in 0..5 {
            assert_eq!(link.step(false).word, Primitive::Align.into());
            assert_eq!(link.state(), LinkState::NoComm);
        }
        link.step(true);
        assert_eq!(link.state(), LinkState::SendAlign);
    }

    #[test]
    fn transmit_handshake_succeeds_once() {
        let mut link = Link::new(quiet());
        up(&mut link);
        push_frame(&mut link, &[0x1234_5678]);

        assert_eq!(link.step(true).word, Primitive::XRdy.into());
        assert_eq!(link.state(), LinkState::SendChkRdy);
        link.receive(Primitive::RRdy.into());
        assert_eq!(link.step(true).word, Primitive::Sof.into());
        assert_eq!(link.state(), LinkState::SendData);

        let mut words = Vec::new();
        while link.state() != LinkState::Wait {
            words.push(link.step(true).word);
        }
        assert_eq!(words.last(), Some(&Primitive::Eof.into()));
        assert_eq!(words.iter().filter(|w| !w.is_primitive).count(), 2);

        assert_eq!(link.step(true).word, Primitive::Wtrm.into());
        link.receive(Primitive::ROk.into());

        let mut successes = 0;
        for _ in 0..10 {
            let out = link.step(true);
            if out.status.contains(LinkStatus::TX_SUCCESS) {
                successes += 1;
            }
            assert!(!out.status.contains(LinkStatus::TX_FAILED));
        }
        assert_eq!(successes, 1);
        assert_eq!(link.state(), LinkState::Idle);
        assert_eq!(link.stats().tx_ok, 1);
    }

    #[test]
    fn r_err_fails_transmission() {
        let mut link = Link::new(quiet());
        up(&mut link);
        push_frame(&mut link, &[1, 2]);
        link.step(true);
        link.receive(Primitive::RRdy.into());
        while link.state() != LinkState::Wait {
            link.step(true);
        }
        link.receive(Primitive::RErr.into());
        let out = link.step(true);
        assert!(out.status.contains(LinkStatus::TX_FAILED));
        assert_eq!(link.state(), LinkState::Idle);
    }

    #[test]
    fn sync_during_data_fails_transmission() {
        let mut link = Link::new(quiet());
        up(&mut link);
        push_frame(&mut link, &[1, 2, 3, 4, 5, 6]);
        link.step(true);
        link.receive(Primitive::RRdy.into());
        link.step(true);
        link.step(true);
        assert_eq!(link.state(), LinkState::SendData);
        link.receive(Primitive::Sync.into());
        let out = link.step(true);
        assert!(out.status.contains(LinkStatus::TX_FAILED));
        assert_eq!(link.state(), LinkState::Idle);
        assert!(!link.tx().has_frame());
    }

    #[test]
    fn remote_hold_is_acknowledged() {
        let mut link = Link::new(quiet());
        up(&mut link);
        push_frame(&mut link, &[1, 2, 3, 4]);
        link.step(true);
        link.receive(Primitive::RRdy.into());
        link.step(true);
        link.receive(Primitive::Hold.into());
        assert_eq!(link.step(true).word, Primitive::HoldA.into());
        assert_eq!(link.state(), LinkState::RcvrHold);
        assert_eq!(link.step(true).word, Primitive::HoldA.into());
        link.receive(Primitive::RIp.into());
        assert!(!link.step(true).word.is_primitive);
        assert_eq!(link.state(), LinkState::SendData);
    }

    #[test]
    fn receive_path_good_frame() {
        let mut link = Link::new(quiet().with_scrambling(false));
        up(&mut link);
        link.receive(Primitive::XRdy.into());
        assert_eq!(link.step(true).word, Primitive::RRdy.into());

        let payload = [0xDEAD_BEEF, 0x0000_0001];
        let mut wire = vec![Word::from(Primitive::Sof)];
        wire.extend(payload.iter().map(|&w| Word::data(w)));
        wire.push(Word::data(frame_crc(&payload)));
        wire.push(Primitive::Eof.into());

        let mut sent = Vec::new();
        let mut status = LinkStatus::empty();
        for w in wire {
            link.receive(w);
            let out = link.step(true);
            sent.push(out.word);
            status |= out.status;
        }
        for _ in 0..3 {
            link.receive(Primitive::Wtrm.into());
            let out = link.step(true);
            sent.push(out.word);
            status |= out.status;
        }
        assert!(sent.contains(&Primitive::RIp.into()));
        assert_eq!(sent.last(), Some(&Primitive::ROk.into()));
        assert!(status.contains(LinkStatus::RX_GOOD_END));
        assert_eq!(link.state(), LinkState::GoodEnd);

        let mut beats = Vec::new();
        drain(link.rx_mut(), &mut beats);
        let data: Vec<u32> = beats.iter().map(|b| b.data).collect();
        assert_eq!(data, payload);

        link.receive(Primitive::Sync.into());
        link.step(true);
        assert_eq!(link.state(), LinkState::Idle);
    }

    #[test]
    fn receive_path_bad_crc_answers_r_err() {
        let mut link = Link::new(quiet().with_scrambling(false));
        up(&mut link);
        link.receive(Primitive::XRdy.into());
        link.step(true);
        let wire = [
            Word::from(Primitive::Sof),
            Word::data(7),
            Word::data(0xBAD0_BAD0),
            Primitive::Eof.into(),
            Primitive::Wtrm.into(),
            Primitive::Wtrm.into(),
        ];
        let mut status = LinkStatus::empty();
        let mut last = Word::data(0);
        for w in wire {
            link.receive(w);
            let out = link.step(true);
            status |= out.status;
            last = out.word;
        }
        assert!(status.contains(LinkStatus::RX_BAD_END));
        assert_eq!(last, Primitive::RErr.into());
        assert_eq!(link.state(), LinkState::BadEnd);
    }

    #[test]
    fn full_fifo_defers_acceptance() {
        let mut link = Link::new(quiet().with_rx_hold_threshold(RX_ALL));
        up(&mut link);
        link.receive(Primitive::XRdy.into());
        assert_eq!(link.step(true).word, Primitive::Sync.into());
        assert_eq!(link.state(), LinkState::RcvWaitFifo);
        link.receive(Primitive::Sync.into());
        link.step(true);
        assert_eq!(link.state(), LinkState::Idle);
    }

    const RX_ALL: usize = crate::link::rx::RX_FIFO_DEPTH;

    #[test]
    fn power_management_is_denied() {
        let mut link = Link::new(quiet());
        up(&mut link);
        link.receive(Primitive::PmReqP.into());
        assert_eq!(link.step(true).word, Primitive::PmNak.into());
        assert_eq!(link.step(true).word, Primitive::PmNak.into());
        assert_eq!(link.state(), LinkState::PmDeny);
        link.receive(Primitive::Sync.into());
        assert_eq!(link.step(true).word, Primitive::Sync.into());
        assert_eq!(link.state(), LinkState::Idle);
    }

    #[test]
    fn phy_loss_requests_reset() {
        let mut link = Link::new(quiet());
        up(&mut link);
        push_frame(&mut link, &[1]);
        link.step(true);
        let out = link.step(false);
        assert!(out.status.contains(LinkStatus::LINK_DOWN | LinkStatus::PHY_RESET_REQUEST));
        assert!(out.status.contains(LinkStatus::TX_FAILED));
        assert_eq!(link.state(), LinkState::NoCommErr);
        assert!(!link.tx().has_frame());
        link.step(false);
        assert_eq!(link.state(), LinkState::NoComm);
        link.step(true);
        link.step(true);
        assert_eq!(link.state(), LinkState::Idle);
    }

    #[test]
    fn host_yields_on_collision() {
        let mut link = Link::new(quiet());
        up(&mut link);
        push_frame(&mut link, &[1]);
        link.step(true);
        link.receive(Primitive::XRdy.into());
        assert_eq!(link.step(true).word, Primitive::RRdy.into());
        assert_eq!(link.state(), LinkState::RcvChkRdy);
        assert!(link.tx().has_frame(), "frame stays queued");
    }

    #[test]
    fn device_holds_x_rdy_through_collision() {
        let mut link = Link::new(quiet().with_role(Role::Device));
        up(&mut link);
        push_frame(&mut link, &[1]);
        link.step(true);
        link.receive(Primitive::XRdy.into());
        assert_eq!(link.step(true).word, Primitive::XRdy.into());
        assert_eq!(link.state(), LinkState::SendChkRdy);
    }

    #[test]
    fn abort_while_receiving_reports_bad_end() {
        let mut link = Link::new(quiet());
        up(&mut link);
        link.receive(Primitive::XRdy.into());
        link.step(true);
        link.receive(Primitive::Sof.into());
        link.step(true);
        assert_eq!(link.state(), LinkState::RcvData);
        link.abort();
        let out = link.step(true);
        assert_eq!(out.word, Primitive::Sync.into());
        assert!(out.status.contains(LinkStatus::RX_BAD_END));
        assert_eq!(link.state(), LinkState::SyncEscape);
        assert_eq!(link.direction(), Some(Direction::Receive));
        link.receive(Primitive::Sync.into());
        link.step(true);
        assert_eq!(link.state(), LinkState::Idle);
    }

    fn transfer(pair: &mut Pair, payload: &[u32], drain_from: usize) -> (Vec<RxBeat>, LinkStatus, LinkStatus) {
        let mut beats = Vec::new();
        let mut next = 0;
        let (mut hs, mut ds) = (LinkStatus::empty(), LinkStatus::empty());
        for tick in 0..20_000 {
            while next < payload.len() && pair.host.tx().ready() {
                let beat = Beat::new(payload[next], next + 1 == payload.len());
                pair.host.tx_mut().push(beat).unwrap();
                next += 1;
            }
            let (h, d) = pair.tick();
            hs |= h;
            ds |= d;
            if tick >= drain_from {
                drain(pair.dev.rx_mut(), &mut beats);
            }
            if hs.intersects(LinkStatus::TX_SUCCESS | LinkStatus::TX_FAILED)
                && pair.host.state() == LinkState::Idle
                && pair.dev.state() == LinkState::Idle
            {
                break;
            }
        }
        drain(pair.dev.rx_mut(), &mut beats);
        (beats, hs, ds)
    }

    fn bring_up(pair: &mut Pair) {
        for _ in 0..4 {
            pair.tick();
        }
        assert!(pair.host.is_up() && pair.dev.is_up());
    }

    #[test]
    fn pair_transfers_frame() {
        let mut pair = Pair::new(quiet(), quiet());
        bring_up(&mut pair);
        let payload: Vec<u32> = (0..64).map(|i| i * 0x0101_0101).collect();
        let (beats, hs, ds) = transfer(&mut pair, &payload, 0);
        assert!(hs.contains(LinkStatus::TX_SUCCESS));
        assert!(ds.contains(LinkStatus::RX_GOOD_END));
        assert_eq!(beats.iter().map(|b| b.data).collect::<Vec<_>>(), payload);
        assert!(beats.last().is_some_and(|b| b.last && !b.abort));
    }

    #[test]
    fn receiver_holds_when_fifo_fills() {
        let mut pair = Pair::new(quiet(), quiet());
        bring_up(&mut pair);
        let payload: Vec<u32> = (0..400).collect();
        // Leave the receive FIFO undrained for a while
        let (beats, hs, _) = transfer(&mut pair, &payload, 300);
        assert!(hs.contains(LinkStatus::TX_SUCCESS));
        assert_eq!(beats.iter().map(|b| b.data).collect::<Vec<_>>(), payload);
        assert_eq!(pair.dev.rx().stats().overflows, 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn pair_survives_cont_and_align(
            payload in proptest::collection::vec(any::<u32>(), 1..300),
            cont in any::<bool>(),
            align in proptest::option::of(4u16..64),
            drain_from in 0usize..200,
        ) {
            let cfg = LinkConfig::new().with_cont(cont).with_align_interval(align);
            let mut pair = Pair::new(cfg, cfg);
            for _ in 0..6 {
                pair.tick();
            }
            let (beats, hs, ds) = transfer(&mut pair, &payload, drain_from);
            prop_assert!(hs.contains(LinkStatus::TX_SUCCESS));
            prop_assert!(ds.contains(LinkStatus::RX_GOOD_END));
            prop_assert_eq!(beats.iter().map(|b| b.data).collect::<Vec<_>>(), payload);
        }

        #[test]
        fn abort_always_escapes(
            script in proptest::collection::vec((0usize..14, any::<bool>()), 0..40),
        ) {
            const REMOTE: [Primitive; 13] = [
                Primitive::Sync, Primitive::XRdy, Primitive::RRdy, Primitive::RIp,
                Primitive::ROk, Primitive::RErr, Primitive::Hold, Primitive::HoldA,
                Primitive::Wtrm, Primitive::Sof, Primitive::Eof, Primitive::PmReqP,
                Primitive::Align,
            ];
            let mut link = Link::new(LinkConfig::new().with_cont(true));
            up(&mut link);
            for (pick, push) in script {
                if push && link.tx().ready() {
                    let _ = link.tx_mut().push(Beat::new(pick as u32, true));
                }
                let word = REMOTE.get(pick).map_or(Word::data(pick as u32), |&p| p.into());
                link.receive(word);
                link.step(true);
            }
            let before = link.state();
            link.abort();
            let out = link.step(true);
            prop_assert_eq!(link.state(), LinkState::SyncEscape);
            if before.direction() == Some(Direction::Transmit) {
                prop_assert!(out.status.contains(LinkStatus::TX_FAILED));
            }
            if before.direction() == Some(Direction::Receive) {
                prop_assert!(out.status.contains(LinkStatus::RX_BAD_END));
            }
        }
    }
}
