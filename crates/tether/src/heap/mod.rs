//! Integer handles for host values held by the guest.
//!
//! Slots 0 through 3 permanently hold `undefined`, `null`, `true` and
//! `false`. Every other slot is either live or a member of the free list,
//! which is threaded through the vacant slots themselves: a free slot stores
//! the index of the next free slot, and `next_free == slots.len()` means the
//! table must grow.

use tracing::{trace, warn};

use crate::error::BridgeError;
use crate::value::HostValue;

pub const UNDEFINED: u32 = 0;
pub const NULL: u32 = 1;
pub const TRUE: u32 = 2;
pub const FALSE: u32 = 3;

/// First handle that can be allocated and released.
pub const RESERVED: u32 = 4;

#[derive(Debug)]
enum Slot {
    Live(HostValue),
    Free { next: u32 },
}

#[derive(Debug)]
pub struct HandleTable {
    slots: Vec<Slot>,
    next_free: u32,
    live: usize,
    strict: bool,
}

impl HandleTable {
    /// Create a table with room for `capacity` slots (at least the
    /// sentinels). With `strict` set, dead handles are reported instead of
    /// reading as `undefined`.
    pub fn new(capacity: usize, strict: bool) -> Self {
        let mut slots = Vec::with_capacity(capacity.max(RESERVED as usize));
        slots.push(Slot::Live(HostValue::Undefined));
        slots.push(Slot::Live(HostValue::Null));
        slots.push(Slot::Live(HostValue::Bool(true)));
        slots.push(Slot::Live(HostValue::Bool(false)));
        Self {
            slots,
            next_free: RESERVED,
            live: 0,
            strict,
        }
    }

    /// Store `value` and return its handle. Sentinel values map to their
    /// permanent slots without allocating.
    pub fn alloc(&mut self, value: HostValue) -> u32 {
        match value {
            HostValue::Undefined => return UNDEFINED,
            HostValue::Null => return NULL,
            HostValue::Bool(true) => return TRUE,
            HostValue::Bool(false) => return FALSE,
            _ => {}
        }

        let idx = self.next_free;
        if idx as usize == self.slots.len() {
            if self.slots.len() == self.slots.capacity() {
                trace!(capacity = self.slots.capacity() * 2, "growing handle table");
                self.slots.reserve(self.slots.len());
            }
            self.slots.push(Slot::Live(value));
            self.next_free = idx + 1;
        } else {
            let prev = std::mem::replace(&mut self.slots[idx as usize], Slot::Live(value));
            self.next_free = match prev {
                Slot::Free { next } => next,
                // A live slot on the free list means the list is corrupt;
                // resume allocation at the end of the table.
                Slot::Live(_) => self.slots.len() as u32,
            };
        }
        self.live += 1;
        idx
    }

    /// Dereference a handle. Dead or unknown handles read as `undefined`;
    /// use [`HandleTable::try_get`] where strict mode should apply.
    pub fn get(&self, handle: u32) -> HostValue {
        match self.slots.get(handle as usize) {
            Some(Slot::Live(value)) => value.clone(),
            _ => HostValue::Undefined,
        }
    }

    /// Dereference a handle, honoring strict mode.
    pub fn try_get(&self, handle: u32) -> Result<HostValue, BridgeError> {
        match self.slots.get(handle as usize) {
            Some(Slot::Live(value)) => Ok(value.clone()),
            _ if self.strict => {
                warn!(handle, "dereference of dead handle");
                Err(BridgeError::DeadHandle(handle))
            }
            _ => Ok(HostValue::Undefined),
        }
    }

    /// Allocate a second handle for the value behind `handle`.
    pub fn clone_ref(&mut self, handle: u32) -> Result<u32, BridgeError> {
        let value = self.try_get(handle)?;
        Ok(self.alloc(value))
    }

    /// Dereference and release in one step.
    pub fn take(&mut self, handle: u32) -> Result<HostValue, BridgeError> {
        let value = self.try_get(handle)?;
        self.release(handle)?;
        Ok(value)
    }

    /// Return a handle to the free list. Sentinels are never released.
    pub fn release(&mut self, handle: u32) -> Result<(), BridgeError> {
        if handle < RESERVED {
            return Ok(());
        }
        match self.slots.get_mut(handle as usize) {
            Some(slot) if matches!(slot, Slot::Live(_)) => {
                *slot = Slot::Free {
                    next: self.next_free,
                };
                self.next_free = handle;
                self.live -= 1;
                Ok(())
            }
            _ if self.strict => {
                warn!(handle, "release of dead handle");
                Err(BridgeError::DeadHandle(handle))
            }
            _ => Ok(()),
        }
    }

    /// Whether `handle` currently refers to a live slot.
    pub fn is_live(&self, handle: u32) -> bool {
        matches!(self.slots.get(handle as usize), Some(Slot::Live(_)))
    }

    /// Number of live handles, sentinels excluded.
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Total slots ever materialized, sentinels included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new(128, false)
    }
}
