//! Reference-counted trampolines for guest closures.
//!
//! A guest closure is a pair of function table indices (invoke and
//! destructor) plus a two-word environment owned by the guest allocator.
//! The host wraps it in a [`ClosureRecord`] so it can be held as a function
//! value, called from host events and released from either side.
//!
//! Lifecycle:
//!
//! * created with one reference, held by the guest;
//! * each invocation takes an extra reference for its duration and clears
//!   the record's data word so a re-entrant call cannot observe it;
//! * when the count reaches zero, either at the end of an invocation or
//!   through [`ClosureRecord::drop_ref`], the destructor runs exactly once
//!   and the record becomes inert.
//!
//! If the last host-side `Rc` to a live record goes away (the guest released
//! the handle without dropping the closure), the record queues its
//! destructor on the [`FinalizerQueue`], which the bridge drains after
//! returning from the guest.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use tracing::{debug, trace};

/// Calls into guest function table entries.
pub trait GuestCallbacks {
    /// `table[invoke](data, meta, arg) -> handle`
    fn call_closure(&mut self, invoke: u32, data: u32, meta: u32, arg: u32)
    -> anyhow::Result<u32>;

    /// `table[dtor](data, meta)`
    fn call_destructor(&mut self, dtor: u32, data: u32, meta: u32) -> anyhow::Result<()>;
}

/// A destructor queued by a record that was dropped while still live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingDestructor {
    pub closure: u64,
    pub dtor: u32,
    pub data: u32,
    pub meta: u32,
}

#[derive(Debug, Default)]
pub struct FinalizerQueue {
    pending: RefCell<Vec<PendingDestructor>>,
}

impl FinalizerQueue {
    fn push(&self, pending: PendingDestructor) {
        self.pending.borrow_mut().push(pending);
    }

    fn take(&self) -> Vec<PendingDestructor> {
        std::mem::take(&mut *self.pending.borrow_mut())
    }

    fn len(&self) -> usize {
        self.pending.borrow().len()
    }
}

pub struct ClosureRecord {
    id: u64,
    invoke: u32,
    dtor: u32,
    data: Cell<u32>,
    meta: u32,
    refcount: Cell<u32>,
    inert: Cell<bool>,
    finalizers: Rc<FinalizerQueue>,
}

impl ClosureRecord {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.get()
    }

    pub fn is_inert(&self) -> bool {
        self.inert.get()
    }

    /// Call the guest closure with an argument handle and return the handle
    /// it produced.
    pub fn invoke<G: GuestCallbacks + ?Sized>(&self, guest: &mut G, arg: u32) -> anyhow::Result<u32> {
        self.refcount.set(self.refcount.get() + 1);
        let data = self.data.replace(0);
        trace!(closure = self.id, refcount = self.refcount.get(), "invoking closure");

        let result = guest.call_closure(self.invoke, data, self.meta, arg);

        let remaining = self.refcount.get() - 1;
        self.refcount.set(remaining);
        let destroyed = if remaining == 0 {
            self.destroy(guest, data)
        } else {
            self.data.set(data);
            Ok(())
        };
        let handle = result?;
        destroyed?;
        Ok(handle)
    }

    /// Release the guest's reference. Returns `true` when this was the last
    /// reference and the destructor has run.
    pub fn drop_ref<G: GuestCallbacks + ?Sized>(&self, guest: &mut G) -> anyhow::Result<bool> {
        let count = self.refcount.get();
        if count == 0 {
            return Ok(false);
        }
        self.refcount.set(count - 1);
        if count == 1 {
            let data = self.data.replace(0);
            self.destroy(guest, data)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn destroy<G: GuestCallbacks + ?Sized>(&self, guest: &mut G, data: u32) -> anyhow::Result<()> {
        if self.inert.replace(true) {
            return Ok(());
        }
        debug!(closure = self.id, "running closure destructor");
        guest.call_destructor(self.dtor, data, self.meta)
    }
}

impl Drop for ClosureRecord {
    fn drop(&mut self) {
        if !self.inert.get() && self.refcount.get() > 0 {
            self.inert.set(true);
            trace!(closure = self.id, "queueing destructor for unreachable closure");
            self.finalizers.push(PendingDestructor {
                closure: self.id,
                dtor: self.dtor,
                data: self.data.get(),
                meta: self.meta,
            });
        }
    }
}

impl fmt::Debug for ClosureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosureRecord")
            .field("id", &self.id)
            .field("invoke", &self.invoke)
            .field("dtor", &self.dtor)
            .field("refcount", &self.refcount.get())
            .field("inert", &self.inert.get())
            .finish()
    }
}

/// Creates closure records and owns their shared finalizer queue.
#[derive(Debug, Default)]
pub struct ClosureRegistry {
    finalizers: Rc<FinalizerQueue>,
    next_id: u64,
}

impl ClosureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, invoke: u32, dtor: u32, data: u32, meta: u32) -> Rc<ClosureRecord> {
        let id = self.next_id;
        self.next_id += 1;
        trace!(closure = id, invoke, dtor, "created closure");
        Rc::new(ClosureRecord {
            id,
            invoke,
            dtor,
            data: Cell::new(data),
            meta,
            refcount: Cell::new(1),
            inert: Cell::new(false),
            finalizers: Rc::clone(&self.finalizers),
        })
    }

    /// Drain destructors queued by records that became unreachable.
    pub fn take_pending(&self) -> Vec<PendingDestructor> {
        self.finalizers.take()
    }

    pub fn pending_len(&self) -> usize {
        self.finalizers.len()
    }

    /// Number of records created so far.
    pub fn created(&self) -> u64 {
        self.next_id
    }
}
