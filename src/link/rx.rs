//! Receive frame pipeline
//!
//! The inverse of [`super::tx`]:
//!
//! 1. Deframing: tracks SOF ... EOF, drops HOLD/HOLDA/ALIGN and anything
//!    outside a frame, and turns SYNC or WTRM inside a frame into an abort.
//! 2. Descramble: XORs every frame dword with a locally run scrambler seeded
//!    at SOF.
//! 3. CRC check: runs the frame CRC over the descrambled dwords. The last
//!    dword before EOF is the sender's CRC; it is compared against the
//!    accumulator and never delivered.
//!
//! Output beats lag the wire by two dwords so that the final payload dword
//! can carry the end-of-frame marker and the CRC verdict on the same beat.
//! The abort flag only ever appears on a `last` beat. A frame that dies
//! before any dword was released produces nothing at all; one that dies
//! later is closed with an aborted `last` beat so consumers can discard it.

use crate::cdc::CdcFifo;

use super::crc::Crc;
use super::primitive::{Primitive, Word, WordKind};
use super::scrambler::Scrambler;

/// Depth of the queue between the RX pipeline and the FIS router
pub const RX_FIFO_DEPTH: usize = 128;

/// One delivered payload dword
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxBeat {
    pub data: u32,
    /// Final dword of the frame
    pub last: bool,
    /// Frame failed (CRC mismatch, overflow or mid-frame abort); only set
    /// together with `last`
    pub abort: bool,
}

/// CRC outcome of a frame that reached EOF
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxVerdict {
    Good,
    Bad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deframe {
    Outside,
    Inside,
}

/// Receive pipeline counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RxStats {
    pub frames_good: u32,
    pub frames_bad: u32,
    pub frames_aborted: u32,
    pub overflows: u32,
}

/// The receive pipeline for one direction of one link
pub struct RxPipeline {
    state: Deframe,
    scrambler: Scrambler,
    crc: Crc,
    /// CRC of every frame dword except the most recent one
    crc_before_last: u32,
    /// Descrambled dwords not yet known to be payload
    held: [u32; 2],
    held_len: usize,
    /// Any dword of the current frame has been delivered
    emitted: bool,
    /// The output queue refused a dword of the current frame
    overflow: bool,
    /// An aborted frame still needs its closing beat
    owed_close: bool,
    verdict: Option<RxVerdict>,
    output: CdcFifo<RxBeat, RX_FIFO_DEPTH>,
    stats: RxStats,
}

impl RxPipeline {
    pub fn new(scrambling: bool) -> Self {
        Self {
            state: Deframe::Outside,
            scrambler: Scrambler::new(scrambling),
            crc: Crc::new(),
            crc_before_last: 0,
            held: [0; 2],
            held_len: 0,
            emitted: false,
            overflow: false,
            owed_close: false,
            verdict: None,
            output: CdcFifo::new(),
            stats: RxStats::default(),
        }
    }

    /// Feed one word from the wire
    pub fn step(&mut self, word: Word) {
        self.flush_owed_close();

        match word.kind() {
            WordKind::Data(value) => {
                if self.state == Deframe::Inside {
                    self.data(value);
                }
            }
            WordKind::Primitive(Primitive::Sof) => {
                if self.state == Deframe::Inside {
                    log::warn!("RX: SOF inside a frame, dropping the open frame");
                    self.drop_frame();
                }
                self.start_frame();
            }
            WordKind::Primitive(Primitive::Eof) => {
                if self.state == Deframe::Inside {
                    self.end_frame();
                }
            }
            WordKind::Primitive(Primitive::Sync) | WordKind::Primitive(Primitive::Wtrm) => {
                if self.state == Deframe::Inside {
                    log::warn!("RX: frame aborted by {:?}", word);
                    self.drop_frame();
                }
            }
            // HOLD, HOLDA, ALIGN, CONT, handshake and unknown primitives are
            // skipped
            _ => {}
        }
    }

    /// Abandon the current frame on request from above
    pub fn abort(&mut self) {
        self.flush_owed_close();
        if self.state == Deframe::Inside {
            self.drop_frame();
        }
    }

    /// Inside SOF ... EOF
    pub fn in_frame(&self) -> bool {
        self.state == Deframe::Inside
    }

    /// A frame reached EOF and its verdict has not been taken yet
    pub fn verdict_pending(&self) -> bool {
        self.verdict.is_some()
    }

    /// CRC verdict of the most recent frame to reach EOF
    pub fn take_verdict(&mut self) -> Option<RxVerdict> {
        self.verdict.take()
    }

    /// Next delivered beat
    pub fn pop(&mut self) -> Option<RxBeat> {
        let beat = self.output.try_pop();
        self.flush_owed_close();
        beat
    }

    /// Free slots in the output queue
    pub fn free(&self) -> usize {
        self.output.free()
    }

    /// Beats waiting in the output queue
    pub fn pending(&self) -> usize {
        self.output.len()
    }

    pub fn stats(&self) -> RxStats {
        self.stats
    }

    fn start_frame(&mut self) {
        self.state = Deframe::Inside;
        self.scrambler.reset();
        self.crc.reset();
        self.crc_before_last = self.crc.finalize();
        self.held_len = 0;
        self.emitted = false;
        self.overflow = false;
    }

    fn data(&mut self, raw: u32) {
        let word = raw ^ self.scrambler.mask();
        self.crc_before_last = self.crc.finalize();
        self.crc.advance(word);

        if self.held_len == 2 {
            let payload = self.held[0];
            self.held[0] = self.held[1];
            self.held[1] = word;
            self.emit(RxBeat {
                data: payload,
                last: false,
                abort: false,
            });
        } else {
            self.held[self.held_len] = word;
            self.held_len += 1;
        }
    }

    fn end_frame(&mut self) {
        self.state = Deframe::Outside;
        self.scrambler.reset_on_last();

        if self.held_len < 2 {
            // No room for both a payload dword and a CRC
            log::warn!("RX: runt frame ({} dwords)", self.held_len);
            self.stats.frames_bad += 1;
            self.verdict = Some(RxVerdict::Bad);
            return;
        }

        let received = self.held[1];
        let computed = self.crc_before_last;
        let crc_ok = received == computed;
        if !crc_ok {
            log::warn!(
                "RX: CRC mismatch (computed {:#010x}, received {:#010x})",
                computed,
                received
            );
        }

        let good = crc_ok && !self.overflow;
        if self.overflow {
            self.owed_close = self.emitted;
        } else {
            self.emit(RxBeat {
                data: self.held[0],
                last: true,
                abort: !good,
            });
        }

        if good {
            self.stats.frames_good += 1;
            self.verdict = Some(RxVerdict::Good);
        } else {
            self.stats.frames_bad += 1;
            self.verdict = Some(RxVerdict::Bad);
        }
        self.held_len = 0;
    }

    fn drop_frame(&mut self) {
        self.state = Deframe::Outside;
        self.scrambler.reset();
        self.crc.reset();
        self.stats.frames_aborted += 1;
        if self.emitted {
            if !self.overflow && !self.output.is_full() {
                let data = if self.held_len > 0 { self.held[0] } else { 0 };
                self.emit(RxBeat {
                    data,
                    last: true,
                    abort: true,
                });
            } else {
                self.owed_close = true;
            }
        }
        self.held_len = 0;
        self.emitted = false;
    }

    fn emit(&mut self, beat: RxBeat) {
        if self.overflow {
            return;
        }
        match self.output.try_push(beat) {
            Ok(()) => self.emitted = true,
            Err(_) => {
                log::warn!("RX: output queue full, frame will be discarded");
                self.stats.overflows += 1;
                self.overflow = true;
            }
        }
    }

    fn flush_owed_close(&mut self) {
        if self.owed_close && !self.output.is_full() {
            let _ = self.output.try_push(RxBeat {
                data: 0,
                last: true,
                abort: true,
            });
            self.owed_close = false;
        }
    }
}
