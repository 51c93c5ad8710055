//! DMA request interface
//!
//! The transport asks an external DMA engine to move payload between memory
//! and the link. One [`DmaChannel`] exists per direction; each carries a
//! request/busy/error handshake, a target address and an SPSC data queue.
//!
//! ```text
//!   transport: request(addr, len)      engine: accept()
//!        Idle ──────────────► Requested ─────────────► Busy
//!         ▲                                              │
//!         └──────── complete() ◄─────────────────────────┤
//!                                                        └─ fail() ──► Error
//! ```

use crate::cdc::CdcFifo;

/// Depth of each channel's data queue
pub const DMA_QUEUE_DEPTH: usize = 32;

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Memory to device (feeds outgoing Data FIS)
    Mm2s,
    /// Device to memory (drains incoming Data FIS)
    S2mm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// A request is already outstanding
    Busy,
    /// Engine-side call without a matching request
    NotRequested,
    /// The engine reported a failure
    Engine,
}

/// Handshake state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaState {
    Idle,
    Requested { addr: u64, len: u32 },
    Busy { addr: u64, len: u32 },
    Error,
}

/// One dword on a channel's data queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaWord {
    pub data: u32,
    /// Final dword of a Data FIS
    pub last: bool,
    /// The Data FIS carrying this dword was aborted
    pub abort: bool,
}

impl DmaWord {
    pub const fn new(data: u32) -> Self {
        Self {
            data,
            last: false,
            abort: false,
        }
    }
}

pub struct DmaChannel {
    direction: DmaDirection,
    state: DmaState,
    queue: CdcFifo<DmaWord, DMA_QUEUE_DEPTH>,
}

impl DmaChannel {
    pub fn new(direction: DmaDirection) -> Self {
        Self {
            direction,
            state: DmaState::Idle,
            queue: CdcFifo::new(),
        }
    }

    pub fn direction(&self) -> DmaDirection {
        self.direction
    }

    pub fn state(&self) -> DmaState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == DmaState::Idle
    }

    /// Transport side: ask the engine for a transfer
    pub fn request(&mut self, addr: u64, len: u32) -> Result<(), DmaError> {
        match self.state {
            DmaState::Idle => {
                log::debug!("DMA: {:?} request {:#x} + {}", self.direction, addr, len);
                self.state = DmaState::Requested { addr, len };
                Ok(())
            }
            _ => Err(DmaError::Busy),
        }
    }

    /// Engine side: take the outstanding request
    pub fn accept(&mut self) -> Result<(u64, u32), DmaError> {
        match self.state {
            DmaState::Requested { addr, len } => {
                self.state = DmaState::Busy { addr, len };
                Ok((addr, len))
            }
            _ => Err(DmaError::NotRequested),
        }
    }

    /// Engine side: the transfer is done
    pub fn complete(&mut self) -> Result<(), DmaError> {
        match self.state {
            DmaState::Busy { .. } => {
                self.state = DmaState::Idle;
                Ok(())
            }
            _ => Err(DmaError::NotRequested),
        }
    }

    /// Engine side: the transfer failed
    pub fn fail(&mut self) {
        log::warn!("DMA: {:?} engine error", self.direction);
        self.state = DmaState::Error;
    }

    /// Drop any request and queued data
    pub fn reset(&mut self) {
        self.state = DmaState::Idle;
        self.queue.clear();
    }

    /// Room for another word
    pub fn can_push(&self) -> bool {
        !self.queue.is_full()
    }

    pub fn push(&mut self, word: DmaWord) -> Result<(), DmaWord> {
        self.queue.try_push(word)
    }

    pub fn pop(&mut self) -> Option<DmaWord> {
        self.queue.try_pop()
    }
}
