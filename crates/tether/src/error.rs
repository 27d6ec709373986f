//! Error taxonomy for the bridge.
//!
//! [`BridgeError`] covers failures detected by the bridge itself (decoding,
//! memory access, handle misuse, missing exports). [`HostError`] is the value
//! a host capability rejects with; it is what the guest sees in its
//! exception slot.

use std::fmt;

/// A failure raised by a host capability or produced while marshalling.
///
/// `name` plays the role of an exception class (`TypeError`, `Error`, ...)
/// and `message` is carried verbatim to whoever observes the failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostError {
    pub name: String,
    pub message: String,
}

impl HostError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// A generic `Error`.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for HostError {}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid utf-8 sequence at byte {valid_up_to} of {len}")]
    Decode { valid_up_to: usize, len: usize },

    #[error("access of {len} bytes at offset {offset} is out of bounds for memory of {size} bytes")]
    OutOfBounds { offset: u32, len: u32, size: usize },

    #[error("offset {offset} is not aligned to {align} bytes")]
    Misaligned { offset: u32, align: u32 },

    #[error("length does not fit in guest address space")]
    LengthOverflow,

    #[error("{0}")]
    Host(HostError),

    #[error("handle {0} is not live")]
    DeadHandle(u32),

    #[error("guest module does not export '{0}'")]
    MissingExport(String),

    #[error("function table entry {0} is not a callable function")]
    BadTableEntry(u32),

    #[error("guest threw: {0}")]
    GuestThrow(String),

    #[error("bridge is not initialized")]
    NotInitialized,
}

impl From<HostError> for BridgeError {
    fn from(err: HostError) -> Self {
        BridgeError::Host(err)
    }
}

impl From<&BridgeError> for HostError {
    /// Describe a bridge failure the way the guest observes it in its
    /// exception slot.
    fn from(err: &BridgeError) -> Self {
        match err {
            BridgeError::Host(inner) => inner.clone(),
            BridgeError::Decode { .. } => HostError::type_error(err.to_string()),
            BridgeError::DeadHandle(_) => HostError::new("ReferenceError", err.to_string()),
            BridgeError::OutOfBounds { .. } | BridgeError::Misaligned { .. } => {
                HostError::new("RangeError", err.to_string())
            }
            _ => HostError::error(err.to_string()),
        }
    }
}
