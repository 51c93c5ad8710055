//! CONT primitive suppression
//!
//! A long run of one primitive may be shortened on the wire: the primitive is
//! sent twice, then CONT, then scrambled junk data until the primitive
//! changes. ALIGN may appear anywhere in such a run without ending it.
//!
//! The receiving side treats CONT as "the previous primitive is still in
//! effect" and ignores data until the next primitive other than ALIGN.
//! Because junk looks like data, a transmitter leaving a suppressed run for a
//! real data dword first repeats the suppressed primitive once to end the
//! run.

use super::primitive::{Primitive, Word, WordKind};
use super::scrambler::Scrambler;

/// Transmit-side CONT generator
pub struct ContEncoder {
    enabled: bool,
    last: Option<Primitive>,
    repeats: u8,
    active: bool,
    junk: Scrambler,
}

/// What the encoder wants on the wire this step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoded {
    /// Send this word
    Send(Word),
    /// Send this run terminator; the offered word must be offered again
    Terminate(Word),
}

impl ContEncoder {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            last: None,
            repeats: 0,
            active: false,
            junk: Scrambler::new(true),
        }
    }

    /// Forget any run, e.g. after link reset
    pub fn reset(&mut self) {
        self.last = None;
        self.repeats = 0;
        self.active = false;
    }

    /// Encode one outgoing word
    pub fn encode(&mut self, word: Word) -> Encoded {
        if !self.enabled {
            return Encoded::Send(word);
        }
        match word.kind() {
            WordKind::Primitive(Primitive::Align) => Encoded::Send(word),
            WordKind::Primitive(prim) if prim.is_repeatable() && self.last == Some(prim) => {
                self.repeats = self.repeats.saturating_add(1);
                if self.repeats == 2 {
                    self.active = true;
                    Encoded::Send(Primitive::Cont.into())
                } else if self.active {
                    Encoded::Send(Word::data(self.junk.mask()))
                } else {
                    Encoded::Send(word)
                }
            }
            WordKind::Primitive(prim) => {
                self.last = prim.is_repeatable().then_some(prim);
                self.repeats = 0;
                self.active = false;
                Encoded::Send(word)
            }
            WordKind::Unknown(_) => {
                self.reset();
                Encoded::Send(word)
            }
            WordKind::Data(_) => {
                if self.active {
                    let prim = self.last.unwrap_or(Primitive::Hold);
                    // The terminator starts a fresh run of the same primitive
                    self.repeats = 0;
                    self.active = false;
                    Encoded::Terminate(prim.into())
                } else {
                    self.last = None;
                    self.repeats = 0;
                    Encoded::Send(word)
                }
            }
        }
    }
}

/// Receive-side CONT interpreter
#[derive(Debug, Default)]
pub struct ContDecoder {
    last: Option<Primitive>,
    suppressing: bool,
}

impl ContDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter one incoming word
    ///
    /// Returns `None` for CONT itself and for junk data inside a suppressed
    /// run; everything else is handed on unchanged.
    pub fn decode(&mut self, word: Word) -> Option<Word> {
        match word.kind() {
            WordKind::Primitive(Primitive::Align) => Some(word),
            WordKind::Primitive(Primitive::Cont) => {
                self.suppressing = self.last.is_some();
                None
            }
            WordKind::Primitive(prim) => {
                self.last = Some(prim);
                self.suppressing = false;
                Some(word)
            }
            WordKind::Unknown(_) => {
                self.last = None;
                self.suppressing = false;
                Some(word)
            }
            WordKind::Data(_) => {
                if self.suppressing {
                    None
                } else {
                    self.last = None;
                    Some(word)
                }
            }
        }
    }

    /// The primitive the far end is currently signalling, if any
    pub fn current(&self) -> Option<Primitive> {
        self.last
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.suppressing = false;
    }
}
