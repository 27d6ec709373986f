//! Host-side asynchrony: a virtual-clock timer queue, a microtask queue and
//! deferred values.
//!
//! Nothing here calls into the guest. The queues only record which closure
//! should run with which argument; [`crate::Bridge::run_microtasks`] and
//! [`crate::Bridge::run_timers`] pop entries and perform the calls.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use tracing::trace;

use crate::closure::ClosureRecord;
use crate::error::HostError;
use crate::value::{HostObject, HostValue};

/// A timer that came due.
#[derive(Debug)]
pub struct Timer {
    pub id: u32,
    pub callback: Rc<ClosureRecord>,
}

/// A queued closure call. When `settle` is set, the closure's result
/// resolves that deferred value.
#[derive(Debug)]
pub struct Microtask {
    pub callback: Rc<ClosureRecord>,
    pub arg: HostValue,
    pub settle: Option<Rc<Deferred>>,
}

#[derive(Debug)]
pub struct EventLoop {
    /// Virtual time in milliseconds.
    now: u64,
    seq: u64,
    next_timer: u32,
    timers: BTreeMap<(u64, u64), Timer>,
    timer_keys: HashMap<u32, (u64, u64)>,
    microtasks: VecDeque<Microtask>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            now: 0,
            seq: 0,
            next_timer: 1,
            timers: BTreeMap::new(),
            timer_keys: HashMap::new(),
            microtasks: VecDeque::new(),
        }
    }

    /// Milliseconds of virtual time elapsed.
    pub fn now_ms(&self) -> f64 {
        self.now as f64
    }

    /// Schedule `callback` to run `delay_ms` from now. Timers with equal
    /// deadlines fire in scheduling order.
    pub fn set_timeout(&mut self, callback: Rc<ClosureRecord>, delay_ms: u64) -> u32 {
        let id = self.next_timer;
        self.next_timer = self.next_timer.wrapping_add(1).max(1);
        let key = (self.now.saturating_add(delay_ms), self.seq);
        self.seq += 1;
        trace!(id, due = key.0, "scheduled timer");
        self.timers.insert(key, Timer { id, callback });
        self.timer_keys.insert(id, key);
        id
    }

    /// Cancel a timer. Returns false when it already fired or never existed.
    pub fn clear_timeout(&mut self, id: u32) -> bool {
        match self.timer_keys.remove(&id) {
            Some(key) => self.timers.remove(&key).is_some(),
            None => false,
        }
    }

    /// Pop the earliest timer due at or before `deadline`, advancing the
    /// clock to its due time.
    pub fn pop_due_timer(&mut self, deadline: u64) -> Option<Timer> {
        let (&key, _) = self.timers.first_key_value()?;
        if key.0 > deadline {
            return None;
        }
        let timer = self.timers.remove(&key)?;
        self.timer_keys.remove(&timer.id);
        self.now = self.now.max(key.0);
        Some(timer)
    }

    /// Deadline `elapsed` from now, in virtual milliseconds.
    pub fn deadline_after(&self, elapsed: Duration) -> u64 {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.now.saturating_add(ms)
    }

    pub fn advance_to(&mut self, deadline: u64) {
        self.now = self.now.max(deadline);
    }

    pub fn queue_microtask(&mut self, task: Microtask) {
        self.microtasks.push_back(task);
    }

    pub fn pop_microtask(&mut self) -> Option<Microtask> {
        self.microtasks.pop_front()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    pub fn pending_microtasks(&self) -> usize {
        self.microtasks.len()
    }
}

/// Settlement state of a [`Deferred`].
#[derive(Debug, Clone)]
pub enum PromiseState {
    Pending,
    Fulfilled(HostValue),
    Rejected(Rc<HostError>),
}

#[derive(Debug)]
enum Reaction {
    /// Run `callback` with the fulfilled value; its result settles `derived`.
    Then {
        callback: Rc<ClosureRecord>,
        derived: Rc<Deferred>,
    },
    /// Settle `derived` the same way.
    Forward(Rc<Deferred>),
}

/// A host value that settles later, exposed to the guest as a `Promise`.
#[derive(Debug)]
pub struct Deferred {
    state: RefCell<PromiseState>,
    reactions: RefCell<Vec<Reaction>>,
}

impl HostObject for Deferred {
    fn class_name(&self) -> &str {
        "Promise"
    }
}

impl Deferred {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            state: RefCell::new(PromiseState::Pending),
            reactions: RefCell::new(Vec::new()),
        })
    }

    pub fn resolved(value: HostValue) -> Rc<Self> {
        Rc::new(Self {
            state: RefCell::new(PromiseState::Fulfilled(value)),
            reactions: RefCell::new(Vec::new()),
        })
    }

    pub fn rejected(err: HostError) -> Rc<Self> {
        Rc::new(Self {
            state: RefCell::new(PromiseState::Rejected(Rc::new(err))),
            reactions: RefCell::new(Vec::new()),
        })
    }

    pub fn state(&self) -> PromiseState {
        self.state.borrow().clone()
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.state.borrow(), PromiseState::Pending)
    }

    /// Fulfill with `value`. A deferred value is adopted instead of being
    /// stored. Settling twice is ignored.
    pub fn resolve(self: &Rc<Self>, value: HostValue, events: &mut EventLoop) {
        if !self.is_pending() {
            return;
        }
        if let Some(inner) = value.downcast::<Deferred>() {
            if Rc::ptr_eq(&inner, self) {
                self.reject(HostError::type_error("chaining cycle detected for promise"), events);
            } else {
                inner.subscribe(Reaction::Forward(Rc::clone(self)), events);
            }
            return;
        }
        self.settle(PromiseState::Fulfilled(value), events);
    }

    pub fn reject(&self, err: HostError, events: &mut EventLoop) {
        if self.is_pending() {
            self.settle(PromiseState::Rejected(Rc::new(err)), events);
        }
    }

    /// Register `callback` for fulfillment; returns the deferred value its
    /// result settles.
    pub fn then(&self, callback: Rc<ClosureRecord>, events: &mut EventLoop) -> Rc<Deferred> {
        let derived = Deferred::new();
        self.subscribe(
            Reaction::Then {
                callback,
                derived: Rc::clone(&derived),
            },
            events,
        );
        derived
    }

    fn subscribe(&self, reaction: Reaction, events: &mut EventLoop) {
        let state = self.state();
        match state {
            PromiseState::Pending => self.reactions.borrow_mut().push(reaction),
            settled => react(reaction, &settled, events),
        }
    }

    fn settle(&self, state: PromiseState, events: &mut EventLoop) {
        *self.state.borrow_mut() = state.clone();
        let reactions = std::mem::take(&mut *self.reactions.borrow_mut());
        for reaction in reactions {
            react(reaction, &state, events);
        }
    }
}

fn react(reaction: Reaction, state: &PromiseState, events: &mut EventLoop) {
    match (reaction, state) {
        (_, PromiseState::Pending) => {}
        (Reaction::Then { callback, derived }, PromiseState::Fulfilled(value)) => {
            events.queue_microtask(Microtask {
                callback,
                arg: value.clone(),
                settle: Some(derived),
            });
        }
        (Reaction::Then { derived, .. }, PromiseState::Rejected(err)) => {
            derived.reject((**err).clone(), events);
        }
        (Reaction::Forward(derived), PromiseState::Fulfilled(value)) => {
            derived.resolve(value.clone(), events);
        }
        (Reaction::Forward(derived), PromiseState::Rejected(err)) => {
            derived.reject((**err).clone(), events);
        }
    }
}
