//! Link and transport configuration
//!
//! Runtime knobs are grouped in two plain structs with chained setters.
//! Queue depths and frame limits are compile-time constants kept next to the
//! code that uses them.

/// Which end of the cable this port is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Backs off when both sides raise X_RDY at once
    Host,
    /// Keeps X_RDY asserted through a collision
    Device,
}

/// Link layer configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    /// Scramble frame contents (seed 0xFFFF); when off the scrambler is
    /// seeded with zero
    pub scrambling: bool,
    /// Collision policy
    pub role: Role,
    /// Transmit an ALIGN pair after this many words; `None` disables it
    pub align_interval: Option<u16>,
    /// Suppress repeated primitives with CONT on transmit
    pub cont: bool,
    /// Receive FIFO free space below which the receiver answers HOLD
    pub rx_hold_threshold: usize,
}

impl LinkConfig {
    /// Host-side defaults
    pub const fn new() -> Self {
        Self {
            scrambling: true,
            role: Role::Host,
            align_interval: Some(256),
            cont: false,
            rx_hold_threshold: 16,
        }
    }

    pub const fn with_scrambling(mut self, scrambling: bool) -> Self {
        self.scrambling = scrambling;
        self
    }

    pub const fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub const fn with_align_interval(mut self, interval: Option<u16>) -> Self {
        self.align_interval = interval;
        self
    }

    pub const fn with_cont(mut self, cont: bool) -> Self {
        self.cont = cont;
        self
    }

    pub const fn with_rx_hold_threshold(mut self, threshold: usize) -> Self {
        self.rx_hold_threshold = threshold;
        self
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport layer configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// How many times a Register H2D FIS is re-sent after the link reports
    /// a failed transmission
    pub max_retries: u8,
}

impl TransportConfig {
    pub const fn new() -> Self {
        Self { max_retries: 3 }
    }

    pub const fn with_max_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}
