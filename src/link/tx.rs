//! Transmit frame pipeline
//!
//! Payload dwords pushed by the transport layer flow through three stages,
//! each holding at most one beat in its output slot:
//!
//! 1. CRC: passes payload through and appends the frame CRC after the last
//!    payload dword.
//! 2. Scramble: XORs payload and CRC with the scrambler mask.
//! 3. Framing: wraps the scrambled run in SOF ... EOF and fills upstream
//!    stalls with HOLD.
//!
//! A beat stays in its slot until the next stage takes it, so back-pressure
//! from the link never loses a word. HOLD fillers are generated on demand
//! and never enter the CRC or the scrambler.

use crate::cdc::CdcFifo;

use super::crc::Crc;
use super::primitive::{Primitive, Word};
use super::scrambler::Scrambler;

/// Depth of the payload queue between the transport and the CRC stage
pub const TX_FIFO_DEPTH: usize = 64;

/// One payload dword and its end-of-payload marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beat {
    pub data: u32,
    pub last: bool,
}

impl Beat {
    pub const fn new(data: u32, last: bool) -> Self {
        Self { data, last }
    }
}

/// CRC insertion stage
struct CrcStage {
    crc: Crc,
    out: Option<Beat>,
    /// CRC of a frame whose last payload dword has already been passed on
    pending: Option<u32>,
}

impl CrcStage {
    fn new() -> Self {
        Self {
            crc: Crc::new(),
            out: None,
            pending: None,
        }
    }

    fn step(&mut self, input: &mut CdcFifo<Beat, TX_FIFO_DEPTH>) {
        if self.out.is_some() {
            return;
        }
        if let Some(crc) = self.pending.take() {
            self.out = Some(Beat::new(crc, true));
            return;
        }
        if let Some(beat) = input.try_pop() {
            self.crc.advance(beat.data);
            if beat.last {
                self.pending = Some(self.crc.finalize());
                self.crc.reset();
            }
            self.out = Some(Beat::new(beat.data, false));
        }
    }

    fn is_empty(&self) -> bool {
        self.out.is_none() && self.pending.is_none()
    }
}

/// Scrambling stage
struct ScrambleStage {
    scrambler: Scrambler,
    out: Option<Beat>,
}

impl ScrambleStage {
    fn step(&mut self, upstream: &mut CrcStage) {
        if self.out.is_some() {
            return;
        }
        if let Some(beat) = upstream.out.take() {
            let data = self.scrambler.apply(beat.data, beat.last);
            self.out = Some(Beat::new(data, beat.last));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    /// Between frames
    Idle,
    /// SOF sent, data dwords flowing
    Data,
    /// CRC dword sent, EOF next
    Eof,
}

/// The transmit pipeline for one direction of one link
pub struct TxPipeline {
    input: CdcFifo<Beat, TX_FIFO_DEPTH>,
    crc: CrcStage,
    scramble: ScrambleStage,
    frame: FrameState,
    /// Dropping the remainder of an aborted payload
    discard: bool,
}

impl TxPipeline {
    pub fn new(scrambling: bool) -> Self {
        Self {
            input: CdcFifo::new(),
            crc: CrcStage::new(),
            scramble: ScrambleStage {
                scrambler: Scrambler::new(scrambling),
                out: None,
            },
            frame: FrameState::Idle,
            discard: false,
        }
    }

    /// Whether [`push`](Self::push) would accept a beat
    pub fn ready(&self) -> bool {
        self.discard || !self.input.is_full()
    }

    /// Offer one payload beat; a full queue hands it back
    pub fn push(&mut self, beat: Beat) -> Result<(), Beat> {
        if self.discard {
            if beat.last {
                self.discard = false;
            }
            return Ok(());
        }
        self.input.try_push(beat)
    }

    /// A frame is queued or partially sent (the link's request to send)
    pub fn has_frame(&self) -> bool {
        self.frame != FrameState::Idle
            || !self.input.is_empty()
            || !self.crc.is_empty()
            || self.scramble.out.is_some()
    }

    /// A frame has been started on the wire and not yet closed
    pub fn in_frame(&self) -> bool {
        self.frame != FrameState::Idle
    }

    /// Move beats one stage forward; called once per step
    pub fn advance(&mut self) {
        // Downstream first so a beat moves exactly one stage per step.
        self.scramble.step(&mut self.crc);
        self.crc.step(&mut self.input);
    }

    /// Take the next framed word for the wire
    ///
    /// Returns `None` only between frames when nothing is queued.
    pub fn pull(&mut self) -> Option<Word> {
        match self.frame {
            FrameState::Idle => {
                if !self.has_frame() {
                    return None;
                }
                self.frame = FrameState::Data;
                Some(Primitive::Sof.into())
            }
            FrameState::Data => match self.scramble.out.take() {
                Some(beat) => {
                    if beat.last {
                        self.frame = FrameState::Eof;
                    }
                    Some(Word::data(beat.data))
                }
                None => Some(Primitive::Hold.into()),
            },
            FrameState::Eof => {
                self.frame = FrameState::Idle;
                Some(Primitive::Eof.into())
            }
        }
    }

    /// Drop the frame currently in flight and restart CRC and scrambler
    ///
    /// Beats of later frames that are already queued are kept. If the
    /// transport has not finished pushing the aborted payload, the rest of it
    /// is swallowed as it arrives.
    pub fn abort(&mut self) {
        if !self.has_frame() {
            return;
        }
        log::debug!("TX: dropping frame in flight");
        if self.frame == FrameState::Eof {
            // Only EOF was left; everything staged belongs to the next frame
            self.frame = FrameState::Idle;
            return;
        }
        self.frame = FrameState::Idle;

        if let Some(beat) = self.scramble.out.take() {
            self.scramble.scrambler.reset();
            if beat.last {
                return;
            }
        }
        self.scramble.scrambler.reset();

        if self.crc.pending.take().is_some() {
            self.crc.out = None;
            return;
        }
        if let Some(beat) = self.crc.out.take() {
            if beat.last {
                return;
            }
        }
        self.crc.crc.reset();

        while let Some(beat) = self.input.try_pop() {
            if beat.last {
                return;
            }
        }
        self.discard = true;
    }
}
