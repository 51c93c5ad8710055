//! PHY collaborator interface
//!
//! The link layer sees the physical layer as a word pipe with a ready flag
//! and a reset request. [`Wire`] is an in-memory stand-in: two bounded word
//! queues between the ends of a cable, an attach switch and a short
//! retraining delay after every reset request in place of the real OOB
//! sequence.

use crate::cdc::CdcFifo;
use crate::link::Word;

/// Words in flight per direction
pub const WIRE_DEPTH: usize = 16;

/// Steps a reset keeps the wire down before it reports ready again
pub const OOB_STEPS: u32 = 8;

/// What a link needs from the layer below
pub trait Phy {
    /// Trained and receiving valid symbols
    fn link_ready(&self) -> bool;

    /// Put one word on the wire; a full serializer hands it back
    fn send(&mut self, word: Word) -> Result<(), Word>;

    /// Next received word, if any
    fn recv(&mut self) -> Option<Word>;

    /// Rerun the out-of-band sequence
    fn request_reset(&mut self);
}

/// Which end of a [`Wire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum End {
    Host,
    Device,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WireStats {
    pub resets: u32,
    /// Words refused because the far end stopped draining
    pub overruns: u32,
}

/// A cable between two link layers
pub struct Wire {
    /// Host to device
    down: CdcFifo<Word, WIRE_DEPTH>,
    /// Device to host
    up: CdcFifo<Word, WIRE_DEPTH>,
    attached: bool,
    training: u32,
    reset_latch: [bool; 2],
    overruns: [u32; 2],
    resets: u32,
}

impl Default for Wire {
    fn default() -> Self {
        Self::new()
    }
}

impl Wire {
    /// An attached, trained wire
    pub const fn new() -> Self {
        Self {
            down: CdcFifo::new(),
            up: CdcFifo::new(),
            attached: true,
            training: 0,
            reset_latch: [false; 2],
            overruns: [0; 2],
            resets: 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.attached && self.training == 0
    }

    pub fn stats(&self) -> WireStats {
        WireStats {
            resets: self.resets,
            overruns: self.overruns[0] + self.overruns[1],
        }
    }

    /// Whether an end has asked for a reset that `tick` has not handled yet
    pub fn reset_requested(&self, end: End) -> bool {
        self.reset_latch[end as usize]
    }

    /// Pull the cable; both ends lose ready
    pub fn detach(&mut self) {
        log::info!("PHY: detached");
        self.attached = false;
        self.flush();
    }

    /// Plug the cable back in; the wire trains before it reports ready
    pub fn attach(&mut self) {
        log::info!("PHY: attached");
        self.attached = true;
        self.training = OOB_STEPS;
    }

    /// Advance the OOB model by one step
    pub fn tick(&mut self) {
        if self.reset_latch.iter().any(|&r| r) {
            self.reset_latch = [false; 2];
            self.resets += 1;
            self.flush();
            if self.attached {
                log::debug!("PHY: OOB reset, retraining");
                self.training = OOB_STEPS;
            }
        } else if self.training > 0 {
            self.training -= 1;
            if self.training == 0 {
                log::debug!("PHY: trained");
            }
        }
    }

    /// Borrow one end for a step; the other end is taken after it is dropped
    pub fn end(&mut self, end: End) -> WireEnd<'_> {
        let ready = self.is_ready();
        let (tx, rx) = match end {
            End::Host => (&mut self.down, &mut self.up),
            End::Device => (&mut self.up, &mut self.down),
        };
        WireEnd {
            tx,
            rx,
            ready,
            reset: &mut self.reset_latch[end as usize],
            overruns: &mut self.overruns[end as usize],
        }
    }

    fn flush(&mut self) {
        self.down.clear();
        self.up.clear();
    }
}

/// One end of a [`Wire`], valid for a single step
pub struct WireEnd<'a> {
    tx: &'a mut CdcFifo<Word, WIRE_DEPTH>,
    rx: &'a mut CdcFifo<Word, WIRE_DEPTH>,
    ready: bool,
    reset: &'a mut bool,
    overruns: &'a mut u32,
}

impl Phy for WireEnd<'_> {
    fn link_ready(&self) -> bool {
        self.ready
    }

    fn send(&mut self, word: Word) -> Result<(), Word> {
        if !self.ready {
            // Electrical idle: nothing reaches the far end
            return Ok(());
        }
        self.tx.try_push(word).inspect_err(|_| *self.overruns += 1)
    }

    fn recv(&mut self) -> Option<Word> {
        if !self.ready {
            return None;
        }
        self.rx.try_pop()
    }

    fn request_reset(&mut self) {
        *self.reset = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Primitive;

    #[test]
    fn words_cross_in_order() {
        let mut wire = Wire::new();
        {
            let mut host = wire.end(End::Host);
            host.send(Primitive::XRdy.into()).unwrap();
            host.send(Word::data(7)).unwrap();
        }
        let mut dev = wire.end(End::Device);
        assert_eq!(dev.recv(), Some(Primitive::XRdy.into()));
        assert_eq!(dev.recv(), Some(Word::data(7)));
        assert_eq!(dev.recv(), None);
        assert_eq!(wire.end(End::Host).recv(), None);
    }

    #[test]
    fn full_lane_hands_word_back() {
        let mut wire = Wire::new();
        let mut host = wire.end(End::Host);
        for i in 0..WIRE_DEPTH - 1 {
            host.send(Word::data(i as u32)).unwrap();
        }
        assert_eq!(host.send(Word::data(99)), Err(Word::data(99)));
        assert_eq!(wire.stats().overruns, 1);
    }

    #[test]
    fn reset_retrains() {
        let mut wire = Wire::new();
        {
            let mut host = wire.end(End::Host);
            host.send(Word::data(1)).unwrap();
            host.request_reset();
        }
        assert!(wire.reset_requested(End::Host));
        wire.tick();
        assert!(!wire.is_ready());
        assert!(!wire.reset_requested(End::Host));
        for _ in 0..OOB_STEPS {
            wire.tick();
        }
        assert!(wire.is_ready());
        // In-flight words were lost with the reset
        assert_eq!(wire.end(End::Device).recv(), None);
        assert_eq!(wire.stats().resets, 1);
    }

    #[test]
    fn detached_wire_is_silent() {
        let mut wire = Wire::new();
        wire.detach();
        {
            let mut host = wire.end(End::Host);
            assert!(!host.link_ready());
            host.send(Word::data(1)).unwrap();
        }
        assert_eq!(wire.end(End::Device).recv(), None);
        wire.attach();
        assert!(!wire.is_ready());
        for _ in 0..OOB_STEPS {
            wire.tick();
        }
        assert!(wire.is_ready());
    }
}
