// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-thread stack of drivers the thread is currently running on behalf of.
//!
//! The stack is thread-local rather than runtime-global, so independent [`crate::Runtime`]
//! instances can share a process. Frames are pushed around every callback invocation and
//! consulted by the dispatcher's inline-or-queue decision.

use core::cell::RefCell;
use core::fmt;
use core::marker::PhantomData;
use core::num::NonZeroU64;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::dispatcher::Dispatcher;
use crate::status::{Result, Status};

static NEXT_DRIVER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a loaded driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DriverId(NonZeroU64);

impl DriverId {
    /// Allocates a process-unique driver identity.
    pub fn new() -> Self {
        let raw = NEXT_DRIVER_ID.fetch_add(1, Ordering::Relaxed);
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    /// Raw numeric value, for logs and dumps.
    pub fn raw(self) -> u64 {
        self.0.get()
    }
}

impl Default for DriverId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "driver#{}", self.0)
    }
}

struct Frame {
    driver: DriverId,
    dispatcher: Option<Dispatcher>,
}

#[derive(Default)]
struct CallStack {
    frames: Vec<Frame>,
    default_dispatcher: Option<Dispatcher>,
}

thread_local! {
    static CALL_STACK: RefCell<CallStack> = RefCell::new(CallStack::default());
}

/// Pushes `driver` with no associated dispatcher. Pair with [`pop_driver`].
pub fn push_driver(driver: DriverId) {
    push_frame(driver, None);
}

pub(crate) fn push_frame(driver: DriverId, dispatcher: Option<Dispatcher>) {
    CALL_STACK.with(|stack| stack.borrow_mut().frames.push(Frame { driver, dispatcher }));
}

/// Pops the top frame and returns its driver.
pub fn pop_driver() -> Option<DriverId> {
    // The frame is dropped outside the borrow: releasing a dispatcher may run arbitrary drops.
    let frame = CALL_STACK.with(|stack| stack.borrow_mut().frames.pop());
    frame.map(|frame| frame.driver)
}

/// RAII guard that pops its frame on drop.
#[must_use = "the driver frame is popped as soon as the scope is dropped"]
pub struct DriverScope {
    _not_send: PhantomData<*const ()>,
}

impl Drop for DriverScope {
    fn drop(&mut self) {
        pop_driver();
    }
}

/// Pushes `driver` for the lifetime of the returned guard.
pub fn enter_driver(driver: DriverId) -> DriverScope {
    push_driver(driver);
    DriverScope { _not_send: PhantomData }
}

pub(crate) fn enter_dispatcher(dispatcher: &Dispatcher) -> DriverScope {
    push_frame(dispatcher.owner(), Some(dispatcher.clone()));
    DriverScope { _not_send: PhantomData }
}

/// Driver on top of the calling thread's stack.
pub fn current_driver() -> Option<DriverId> {
    CALL_STACK.with(|stack| stack.borrow().frames.last().map(|frame| frame.driver))
}

/// Dispatcher the calling thread is running on.
///
/// With an empty stack this is the default dispatcher installed by
/// [`set_default_dispatcher`], if any.
pub fn current_dispatcher() -> Option<Dispatcher> {
    CALL_STACK.with(|stack| {
        let stack = stack.borrow();
        match stack.frames.last() {
            Some(frame) => frame.dispatcher.clone(),
            None => stack.default_dispatcher.clone(),
        }
    })
}

/// Returns true if `driver` appears anywhere on the calling thread's stack.
pub fn is_driver_in_call_stack(driver: DriverId) -> bool {
    CALL_STACK.with(|stack| stack.borrow().frames.iter().any(|frame| frame.driver == driver))
}

pub(crate) fn is_dispatcher_in_call_stack(dispatcher: &Dispatcher) -> bool {
    CALL_STACK.with(|stack| {
        stack
            .borrow()
            .frames
            .iter()
            .any(|frame| frame.dispatcher.as_ref().is_some_and(|d| d == dispatcher))
    })
}

/// Returns true if the calling thread is not running on behalf of any driver.
pub fn is_call_stack_empty() -> bool {
    CALL_STACK.with(|stack| stack.borrow().frames.is_empty())
}

/// Installs the dispatcher reported by [`current_dispatcher`] while no driver frame is active.
///
/// Fails with [`Status::BadState`] when called from inside a driver frame.
pub fn set_default_dispatcher(dispatcher: Option<Dispatcher>) -> Result<()> {
    let previous = CALL_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        if !stack.frames.is_empty() {
            return Err(Status::BadState);
        }
        Ok(core::mem::replace(&mut stack.default_dispatcher, dispatcher))
    })?;
    drop(previous);
    Ok(())
}
