//! SATA transport layer
//!
//! FIS layouts, the command table, the shadow register file, the receive
//! router and the command state machine that ties them to a [`crate::link::Link`].

pub mod command;
pub mod fis;
pub mod fsm;
pub mod regs;
pub mod router;

pub use command::{CommandError, CommandInfo, Protocol, SECTOR_SIZE, classify};
pub use fis::{ControlFis, Fis, FisError, FisType};
pub use fsm::{Completion, Transport, TransportState, TransportStats};
pub use regs::{Register, RegisterError, Registers, TransportErrors};
pub use router::{DropReason, Routed, Router};
