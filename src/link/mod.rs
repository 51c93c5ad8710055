//! SATA link layer
//!
//! Word-level framing, CRC, scrambling, CONT suppression and the primitive
//! handshake. The transport layer talks to a [`Link`] through its TX and RX
//! pipelines; the PHY side exchanges one [`Word`] per step in each direction.

pub mod cont;
pub mod crc;
pub mod fsm;
pub mod primitive;
pub mod rx;
pub mod scrambler;
pub mod tx;

pub use fsm::{Direction, Link, LinkOutput, LinkState, LinkStats, LinkStatus, Remote};
pub use primitive::{Primitive, Word, WordKind};
pub use rx::{RxBeat, RxPipeline, RxVerdict};
pub use tx::{Beat, TxPipeline};
