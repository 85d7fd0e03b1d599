//! Trace and span identifiers plus trace flags.

use crate::error::TraceParentError;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 128-bit trace identifier. Zero is the invalid id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TraceId(pub u128);

/// 64-bit span identifier. Zero is the invalid id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpanId(pub u64);

/// W3C trace flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TraceFlags(pub u8);

impl TraceId {
    pub const INVALID: TraceId = TraceId(0);

    /// Generates a random, valid trace id.
    pub fn random() -> Self {
        loop {
            let id = rand::random::<u128>();
            if id != 0 {
                return Self(id);
            }
        }
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Parses exactly 32 lowercase hex characters.
    pub fn from_hex(hex: &str) -> Result<Self, TraceParentError> {
        if !is_lower_hex(hex, 32) {
            return Err(TraceParentError::invalid("trace-id", hex));
        }
        u128::from_str_radix(hex, 16)
            .map(Self)
            .map_err(|_| TraceParentError::invalid("trace-id", hex))
    }

    pub fn to_hex(self) -> String {
        format!("{:032x}", self.0)
    }
}

impl SpanId {
    pub const INVALID: SpanId = SpanId(0);

    /// Generates a random, valid span id.
    pub fn random() -> Self {
        loop {
            let id = rand::random::<u64>();
            if id != 0 {
                return Self(id);
            }
        }
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Parses exactly 16 lowercase hex characters.
    pub fn from_hex(hex: &str) -> Result<Self, TraceParentError> {
        if !is_lower_hex(hex, 16) {
            return Err(TraceParentError::invalid("parent-id", hex));
        }
        u64::from_str_radix(hex, 16)
            .map(Self)
            .map_err(|_| TraceParentError::invalid("parent-id", hex))
    }

    pub fn to_hex(self) -> String {
        format!("{:016x}", self.0)
    }
}

impl TraceFlags {
    pub const NONE: TraceFlags = TraceFlags(0x00);
    pub const SAMPLED: TraceFlags = TraceFlags(0x01);

    #[inline]
    pub fn is_sampled(self) -> bool {
        self.0 & Self::SAMPLED.0 != 0
    }

    /// Returns a copy with the sampled bit set or cleared.
    #[inline]
    pub fn with_sampled(self, sampled: bool) -> Self {
        if sampled {
            Self(self.0 | Self::SAMPLED.0)
        } else {
            Self(self.0 & !Self::SAMPLED.0)
        }
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Display for TraceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", self.0)
    }
}

pub(crate) fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
