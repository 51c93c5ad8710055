//! sata-stack - SATA link and transport layer protocol engine
//!
//! A cycle-stepped model of the host side of a SATA port: the link layer
//! that frames, scrambles and CRC-protects FIS packets over a stream of
//! 32-bit words, and the transport layer that turns shadow-register commands
//! into FIS exchanges and steers received payload to a DMA engine.
//!
//! ```text
//! Transport ─► TX pipeline ─► Link FSM ─► Phy ─► Link FSM ─► RX pipeline ─► Router ─► Transport
//! ```
//!
//! The crate is `no_std` and allocation free; every queue is a fixed-size
//! `heapless` structure.

#![cfg_attr(not(test), no_std)]

pub mod cdc;
pub mod config;
pub mod dma;
pub mod host;
pub mod link;
pub mod logger;
pub mod phy;
pub mod sim;
pub mod transport;

pub use config::{LinkConfig, Role, TransportConfig};
pub use host::{HostPort, MemoryDma};
pub use phy::{Phy, Wire};
pub use sim::Device;
