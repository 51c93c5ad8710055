//! FIS router
//!
//! Looks at the first dword of every received frame and steers the rest of
//! it: control FIS collect in a shadow buffer that is only handed out once
//! the whole frame arrived intact; Data FIS payload is byte-swapped and
//! passed on word by word, aborts included.

use crate::dma::DmaWord;
use crate::link::RxBeat;

use super::fis::{ControlFis, FisError, FisType, SHADOW_FIS_WORDS};

/// Why a frame produced nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The link aborted the frame (CRC, SYNC, overflow)
    Aborted,
    /// Longer than any control FIS
    Overlong,
    Malformed(FisError),
}

/// Result of routing one beat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Consumed, nothing to hand out yet
    Pending,
    /// Data FIS payload for the DMA path
    Data(DmaWord),
    /// A complete control FIS
    Control(ControlFis),
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Steering {
    /// Next beat starts a frame
    Start,
    Control,
    Data,
    /// Rest of an unusable frame
    Skip,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouterStats {
    pub control: u32,
    pub data: u32,
    pub dropped: u32,
}

pub struct Router {
    steering: Steering,
    shadow: [u32; SHADOW_FIS_WORDS],
    len: usize,
    overlong: bool,
    stats: RouterStats,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub const fn new() -> Self {
        Self {
            steering: Steering::Start,
            shadow: [0; SHADOW_FIS_WORDS],
            len: 0,
            overlong: false,
            stats: RouterStats {
                control: 0,
                data: 0,
                dropped: 0,
            },
        }
    }

    /// Inside a Data FIS
    pub fn in_data(&self) -> bool {
        self.steering == Steering::Data
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    /// Forget any partially received frame
    pub fn reset(&mut self) {
        self.steering = Steering::Start;
        self.len = 0;
        self.overlong = false;
    }

    pub fn route(&mut self, beat: RxBeat) -> Routed {
        match self.steering {
            Steering::Start => self.start(beat),
            Steering::Control => {
                if self.len < SHADOW_FIS_WORDS {
                    self.shadow[self.len] = beat.data;
                    self.len += 1;
                } else {
                    self.overlong = true;
                }
                if beat.last {
                    self.finish_control(beat.abort)
                } else {
                    Routed::Pending
                }
            }
            Steering::Data => {
                if beat.last {
                    self.steering = Steering::Start;
                    if beat.abort {
                        log::warn!("XPORT: Data FIS aborted");
                    }
                }
                Routed::Data(DmaWord {
                    data: beat.data.swap_bytes(),
                    last: beat.last,
                    abort: beat.abort,
                })
            }
            Steering::Skip => {
                if beat.last {
                    self.steering = Steering::Start;
                }
                Routed::Pending
            }
        }
    }

    fn start(&mut self, beat: RxBeat) -> Routed {
        if beat.last && beat.abort {
            return self.discard(DropReason::Aborted);
        }
        match FisType::of(beat.data) {
            Some(FisType::Data) => {
                self.stats.data += 1;
                if !beat.last {
                    self.steering = Steering::Data;
                }
                Routed::Pending
            }
            Some(_) => {
                self.shadow[0] = beat.data;
                self.len = 1;
                self.overlong = false;
                self.steering = Steering::Control;
                if beat.last {
                    self.finish_control(false)
                } else {
                    Routed::Pending
                }
            }
            None => {
                log::warn!("XPORT: unknown FIS type {:#04x}", beat.data as u8);
                if !beat.last {
                    self.steering = Steering::Skip;
                }
                self.discard(DropReason::Malformed(FisError::UnknownType(beat.data as u8)))
            }
        }
    }

    fn finish_control(&mut self, abort: bool) -> Routed {
        self.steering = Steering::Start;
        if abort {
            log::warn!("XPORT: control FIS aborted, shadow registers unchanged");
            return self.discard(DropReason::Aborted);
        }
        if self.overlong {
            log::warn!("XPORT: overlong control FIS");
            return self.discard(DropReason::Overlong);
        }
        match ControlFis::parse(&self.shadow[..self.len]) {
            Ok(fis) => {
                self.stats.control += 1;
                Routed::Control(fis)
            }
            Err(err) => {
                log::warn!("XPORT: malformed FIS: {:?}", err);
                self.discard(DropReason::Malformed(err))
            }
        }
    }

    fn discard(&mut self, reason: DropReason) -> Routed {
        self.stats.dropped += 1;
        Routed::Dropped(reason)
    }
}
