//! Words and primitives
//!
//! Everything on the wire is a 32-bit [`Word`] carrying a flag that says
//! whether its first byte was a K-character (a control "primitive") or plain
//! data. Primitives are recognized and emitted through a fixed bit-pattern
//! table so the codec stays pure data.
//!
//! Reference: Serial ATA Revision 3.x, 9.4 "Primitives".

use core::fmt;

/// One 32-bit wire word plus its is-primitive tag
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Word {
    /// Raw dword as it appears on the wire (byte 0 in bits 7:0)
    pub value: u32,
    /// Set when byte 0 is a K-character
    pub is_primitive: bool,
}

impl Word {
    /// A data word
    pub const fn data(value: u32) -> Self {
        Self {
            value,
            is_primitive: false,
        }
    }

    /// A raw primitive word (may or may not be a known primitive)
    pub const fn control(value: u32) -> Self {
        Self {
            value,
            is_primitive: true,
        }
    }

    /// Classify this word, see [`classify`]
    pub fn primitive(self) -> Option<Primitive> {
        classify(self)
    }

    /// Split the word into data, known primitive or unknown control word
    pub fn kind(self) -> WordKind {
        if !self.is_primitive {
            WordKind::Data(self.value)
        } else {
            match classify(self) {
                Some(prim) => WordKind::Primitive(prim),
                None => WordKind::Unknown(self.value),
            }
        }
    }
}

impl From<Primitive> for Word {
    fn from(prim: Primitive) -> Self {
        encode(prim)
    }
}

impl fmt::Debug for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            WordKind::Data(v) => write!(f, "D({:#010x})", v),
            WordKind::Primitive(p) => write!(f, "{:?}", p),
            WordKind::Unknown(v) => write!(f, "K?({:#010x})", v),
        }
    }
}

/// Result of [`Word::kind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordKind {
    /// Plain data dword
    Data(u32),
    /// One of the recognized primitives
    Primitive(Primitive),
    /// A control word outside the known set ("don't care")
    Unknown(u32),
}

/// The link-layer primitives this engine speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Align,
    Sync,
    XRdy,
    RRdy,
    RIp,
    ROk,
    RErr,
    Hold,
    HoldA,
    Wtrm,
    Sof,
    Eof,
    Cont,
    PmReqP,
    PmReqS,
    PmNak,
}

/// Canonical dword encodings (byte 0 is K28.5 for ALIGN, K28.3 otherwise)
pub const PRIMITIVE_TABLE: [(Primitive, u32); 16] = [
    (Primitive::Align, 0x7B4A_4ABC),
    (Primitive::Sync, 0xB5B5_957C),
    (Primitive::XRdy, 0x5757_B57C),
    (Primitive::RRdy, 0x4A4A_957C),
    (Primitive::RIp, 0x5555_B57C),
    (Primitive::ROk, 0x3535_B57C),
    (Primitive::RErr, 0x5656_B57C),
    (Primitive::Hold, 0xD5D5_AA7C),
    (Primitive::HoldA, 0x9595_AA7C),
    (Primitive::Wtrm, 0x5858_B57C),
    (Primitive::Sof, 0x3737_B57C),
    (Primitive::Eof, 0xD5D5_B57C),
    (Primitive::Cont, 0x9999_AA7C),
    (Primitive::PmReqP, 0x1717_B57C),
    (Primitive::PmReqS, 0x7575_957C),
    (Primitive::PmNak, 0xF5F5_957C),
];

impl Primitive {
    /// Canonical bit pattern
    pub fn bits(self) -> u32 {
        // The table is indexed in declaration order.
        PRIMITIVE_TABLE[self as usize].1
    }

    /// Primitives that may be suppressed with CONT when repeated
    pub fn is_repeatable(self) -> bool {
        !matches!(
            self,
            Primitive::Align | Primitive::Sof | Primitive::Eof | Primitive::Cont
        )
    }
}

/// Recognize a primitive word
///
/// Data words and control words outside the known set both yield `None`;
/// unknown control words are legal and simply carry no meaning.
pub fn classify(word: Word) -> Option<Primitive> {
    if !word.is_primitive {
        return None;
    }
    PRIMITIVE_TABLE
        .iter()
        .find(|(_, bits)| *bits == word.value)
        .map(|(prim, _)| *prim)
}

/// Emit the canonical word for a primitive
pub fn encode(prim: Primitive) -> Word {
    Word::control(prim.bits())
}
