// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Dispatchers: per-driver scheduling contexts.
//!
//! Every signal aimed at a dispatcher (a channel becoming readable, a token arriving, a timer
//! expiring, a cancellation) either runs its handler inline on the signaling thread or is
//! queued for a worker of the dispatcher's thread pool. The choice is made under the
//! dispatcher lock:
//!
//! - the signaling thread must be running on behalf of some driver;
//! - the owning driver must not already be on that thread's call stack;
//! - a synchronized dispatcher must be idle with an empty queue;
//! - an `ALLOW_SYNC_CALLS` dispatcher only runs inline for callers that may block themselves.
//!
//! Posted tasks and timers never run inline. Shutdown converts everything pending into
//! `Canceled` deliveries and then runs the shutdown observer exactly once on a worker.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::runtime::RuntimeInner;
use crate::status::{CallbackStatus, Result, Status};
use crate::thread_context::{self, DriverId};
use crate::thread_pool::ThreadPool;

bitflags! {
    /// Creation options of a dispatcher.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct DispatcherOptions: u32 {
        /// Callbacks may run concurrently on several threads.
        const UNSYNCHRONIZED = 1 << 0;
        /// Callbacks may block in [`crate::Channel::call`].
        const ALLOW_SYNC_CALLS = 1 << 1;
    }
}

/// Lifecycle of a dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DispatcherState {
    /// Accepting registrations and running callbacks.
    Running,
    /// Draining cancellations; the observer has not run yet.
    ShuttingDown,
    /// Observer ran (or is running); only [`Dispatcher::destroy`] remains.
    ShutDown,
    /// Unregistered from the runtime.
    Destroyed,
}

/// Sequence identity of a synchronized dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SequenceId(u64);

impl SequenceId {
    /// Raw value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Callback run by a dispatcher with the status of the wait it was registered for.
pub type Handler = Box<dyn FnOnce(&Dispatcher, CallbackStatus) + Send + 'static>;

/// Observer run once when a dispatcher finishes shutting down.
pub type ShutdownObserver = Box<dyn FnOnce(&Dispatcher) + Send + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct WaitId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WaitKind {
    ChannelRead,
    Task,
    Timer,
    Token,
}

struct Registered {
    kind: WaitKind,
    handler: Handler,
}

struct Queued {
    id: WaitId,
    kind: WaitKind,
    handler: Handler,
    status: CallbackStatus,
}

struct State {
    lifecycle: DispatcherState,
    queue: VecDeque<Queued>,
    waits: BTreeMap<WaitId, Registered>,
    running: usize,
    ticket_posted: bool,
    observer: Option<ShutdownObserver>,
    observer_started: bool,
    observer_done: bool,
    next_wait: u64,
    completed: u64,
}

impl State {
    fn observer_due(&self) -> bool {
        self.lifecycle == DispatcherState::ShuttingDown
            && self.queue.is_empty()
            && self.running == 0
            && !self.observer_started
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty()
            && self.running == 0
            && self.lifecycle != DispatcherState::ShuttingDown
            && (!self.observer_started || self.observer_done)
    }
}

pub(crate) struct DispatcherInner {
    id: u64,
    owner: DriverId,
    name: String,
    role: String,
    options: AtomicU32,
    unmanaged: bool,
    pool: Option<Arc<ThreadPool>>,
    runtime: Weak<RuntimeInner>,
    state: Mutex<State>,
    idle: Condvar,
}

/// Parameters gathered by the runtime when creating a dispatcher.
pub(crate) struct DispatcherParams {
    pub(crate) id: u64,
    pub(crate) owner: DriverId,
    pub(crate) options: DispatcherOptions,
    pub(crate) name: String,
    pub(crate) role: String,
    pub(crate) unmanaged: bool,
    pub(crate) pool: Option<Arc<ThreadPool>>,
    pub(crate) runtime: Weak<RuntimeInner>,
    pub(crate) observer: ShutdownObserver,
}

/// Shared handle to a dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl PartialEq for Dispatcher {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Dispatcher {}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.inner.name)
            .field("owner", &self.inner.owner)
            .field("options", &self.options())
            .finish()
    }
}

/// Handle to a posted task; see [`TaskHandle::cancel`].
#[derive(Debug, Clone)]
pub struct TaskHandle {
    dispatcher: Weak<DispatcherInner>,
    id: WaitId,
}

impl TaskHandle {
    /// Withdraws the task if it has not started. The handler is dropped without running.
    ///
    /// Returns [`Status::NotFound`] once the task is running or has completed.
    pub fn cancel(&self) -> Result<()> {
        let inner = self.dispatcher.upgrade().ok_or(Status::NotFound)?;
        Dispatcher { inner }.remove_task(self.id)
    }
}

impl Dispatcher {
    pub(crate) fn new(params: DispatcherParams) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                id: params.id,
                owner: params.owner,
                name: params.name,
                role: params.role,
                options: AtomicU32::new(params.options.bits()),
                unmanaged: params.unmanaged,
                pool: params.pool,
                runtime: params.runtime,
                state: Mutex::new(State {
                    lifecycle: DispatcherState::Running,
                    queue: VecDeque::new(),
                    waits: BTreeMap::new(),
                    running: 0,
                    ticket_posted: false,
                    observer: Some(params.observer),
                    observer_started: false,
                    observer_done: false,
                    next_wait: 1,
                    completed: 0,
                }),
                idle: Condvar::new(),
            }),
        }
    }

    /// Dispatcher the calling thread is currently running on, if any.
    pub fn current() -> Option<Dispatcher> {
        thread_context::current_dispatcher()
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// Driver owning this dispatcher.
    pub fn owner(&self) -> DriverId {
        self.inner.owner
    }

    /// Debug name given at creation.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Scheduler role; empty for the default pool.
    pub fn scheduler_role(&self) -> &str {
        &self.inner.role
    }

    /// Current options. `ALLOW_SYNC_CALLS` disappears after [`Dispatcher::seal`].
    pub fn options(&self) -> DispatcherOptions {
        DispatcherOptions::from_bits_truncate(self.inner.options.load(Ordering::Acquire))
    }

    /// True for dispatchers created with `UNSYNCHRONIZED`.
    pub fn is_unsynchronized(&self) -> bool {
        self.options().contains(DispatcherOptions::UNSYNCHRONIZED)
    }

    /// True while `ALLOW_SYNC_CALLS` is in effect.
    pub fn allows_sync_calls(&self) -> bool {
        self.options().contains(DispatcherOptions::ALLOW_SYNC_CALLS)
    }

    /// True for dispatchers drained by [`crate::Runtime::run_until_idle`].
    pub fn is_unmanaged(&self) -> bool {
        self.inner.unmanaged
    }

    /// Lifecycle state.
    pub fn state(&self) -> DispatcherState {
        self.inner.state.lock().lifecycle
    }

    /// True if callbacks are queued and not yet started.
    pub fn has_queued_tasks(&self) -> bool {
        !self.inner.state.lock().queue.is_empty()
    }

    /// Number of queued callbacks.
    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// True when nothing runs, nothing is queued and no shutdown observer is pending.
    pub fn is_idle(&self) -> bool {
        self.inner.state.lock().is_idle()
    }

    /// Sequence identity; only synchronized dispatchers have one, and only their own
    /// callbacks may ask for it.
    pub fn sequence_id(&self) -> Result<SequenceId> {
        if self.is_unsynchronized() {
            return Err(Status::WrongType);
        }
        match thread_context::current_dispatcher() {
            Some(current) if current == *self => Ok(SequenceId(self.inner.id)),
            _ => Err(Status::BadState),
        }
    }

    pub(crate) fn runtime(&self) -> Option<Arc<RuntimeInner>> {
        self.inner.runtime.upgrade()
    }

    // ---- registrations ----------------------------------------------------------------

    /// Registers a wait whose handler runs when [`Dispatcher::signal_wait`] fires it.
    pub(crate) fn register_wait(&self, kind: WaitKind, handler: Handler) -> Result<WaitId> {
        let mut st = self.inner.state.lock();
        if st.lifecycle != DispatcherState::Running {
            return Err(Status::Unavailable);
        }
        let id = WaitId(st.next_wait);
        st.next_wait += 1;
        st.waits.insert(id, Registered { kind, handler });
        Ok(id)
    }

    /// True while the wait is registered or its callback is queued.
    pub(crate) fn is_wait_pending(&self, id: WaitId) -> bool {
        let st = self.inner.state.lock();
        st.waits.contains_key(&id) || st.queue.iter().any(|q| q.id == id)
    }

    /// Fires a registered wait. Returns false if it is no longer registered.
    pub(crate) fn signal_wait(&self, id: WaitId, status: CallbackStatus, may_inline: bool) -> bool {
        let mut st = self.inner.state.lock();
        let Some(reg) = st.waits.remove(&id) else {
            return false;
        };
        let item = Queued { id, kind: reg.kind, handler: reg.handler, status };
        if may_inline && self.can_run_inline(&st) {
            st.running += 1;
            drop(st);
            log::trace!("dispatcher {}: inline {:?}", self.inner.name, item.kind);
            let _running = RunningCallback(self);
            self.invoke(item);
        } else {
            log::trace!("dispatcher {}: queued {:?}", self.inner.name, item.kind);
            st.queue.push_back(item);
            self.schedule_locked(&mut st);
        }
        true
    }

    /// Cancels a wait: a registered wait is queued with `Canceled`, a queued one has its
    /// status replaced. Either way the handler still runs exactly once.
    pub(crate) fn cancel_wait(&self, id: WaitId) -> Result<()> {
        let mut st = self.inner.state.lock();
        if let Some(reg) = st.waits.remove(&id) {
            st.queue.push_back(Queued {
                id,
                kind: reg.kind,
                handler: reg.handler,
                status: Err(Status::Canceled),
            });
            self.schedule_locked(&mut st);
            return Ok(());
        }
        match st.queue.iter_mut().find(|q| q.id == id) {
            Some(queued) => {
                queued.status = Err(Status::Canceled);
                Ok(())
            }
            None => Err(Status::NotFound),
        }
    }

    fn remove_task(&self, id: WaitId) -> Result<()> {
        let removed = {
            let mut st = self.inner.state.lock();
            let removed = match st.waits.remove(&id) {
                Some(reg) => Some(reg.handler),
                None => st
                    .queue
                    .iter()
                    .position(|q| q.id == id)
                    .and_then(|pos| st.queue.remove(pos))
                    .map(|q| q.handler),
            };
            if removed.is_some() && st.is_idle() {
                self.inner.idle.notify_all();
            }
            removed
        };
        match removed {
            Some(handler) => {
                drop(handler);
                Ok(())
            }
            None => Err(Status::NotFound),
        }
    }

    // ---- tasks ---------------------------------------------------------------------------

    /// Queues `task`. Tasks never run inline, even from a thread outside any driver.
    pub fn post_task(
        &self,
        task: impl FnOnce(&Dispatcher, CallbackStatus) + Send + 'static,
    ) -> Result<TaskHandle> {
        let mut st = self.inner.state.lock();
        if st.lifecycle != DispatcherState::Running {
            return Err(Status::BadState);
        }
        let id = WaitId(st.next_wait);
        st.next_wait += 1;
        st.queue.push_back(Queued {
            id,
            kind: WaitKind::Task,
            handler: Box::new(task),
            status: Ok(()),
        });
        self.schedule_locked(&mut st);
        Ok(TaskHandle { dispatcher: Arc::downgrade(&self.inner), id })
    }

    /// Queues `task` once `deadline` passes.
    pub fn post_task_at(
        &self,
        deadline: Instant,
        task: impl FnOnce(&Dispatcher, CallbackStatus) + Send + 'static,
    ) -> Result<TaskHandle> {
        let runtime = self.runtime().ok_or(Status::BadState)?;
        let id = self.register_wait(WaitKind::Timer, Box::new(task)).map_err(|_| Status::BadState)?;
        let target = Arc::downgrade(&self.inner);
        let fire = Box::new(move || {
            if let Some(inner) = target.upgrade() {
                Dispatcher { inner }.signal_wait(id, Ok(()), false);
            }
        });
        if let Err(err) = runtime.timers().schedule(deadline, fire) {
            let _ = self.remove_task(id);
            return Err(err);
        }
        Ok(TaskHandle { dispatcher: Arc::downgrade(&self.inner), id })
    }

    /// Queues `task` after `delay`.
    pub fn post_delayed_task(
        &self,
        delay: Duration,
        task: impl FnOnce(&Dispatcher, CallbackStatus) + Send + 'static,
    ) -> Result<TaskHandle> {
        self.post_task_at(Instant::now() + delay, task)
    }

    // ---- scheduling ----------------------------------------------------------------------

    fn can_run_inline(&self, st: &State) -> bool {
        if st.lifecycle != DispatcherState::Running {
            return false;
        }
        if thread_context::is_call_stack_empty()
            || thread_context::is_driver_in_call_stack(self.inner.owner)
        {
            return false;
        }
        let options = self.options();
        if options.contains(DispatcherOptions::ALLOW_SYNC_CALLS)
            && !thread_context::current_dispatcher().is_some_and(|d| d.allows_sync_calls())
        {
            return false;
        }
        options.contains(DispatcherOptions::UNSYNCHRONIZED)
            || (st.running == 0 && st.queue.is_empty())
    }

    /// Hands the dispatcher to a pool worker. Synchronized dispatchers hold at most one
    /// ticket and none while a callback runs; unsynchronized ones get a ticket per call.
    fn schedule_locked(&self, st: &mut State) {
        if self.inner.unmanaged {
            return;
        }
        let Some(pool) = &self.inner.pool else {
            return;
        };
        if !self.is_unsynchronized() {
            if st.ticket_posted || st.running > 0 {
                return;
            }
            st.ticket_posted = true;
        }
        let this = self.clone();
        pool.post(Box::new(move || {
            this.run_ticket();
        }));
    }

    fn invoke(&self, item: Queued) {
        let _scope = thread_context::enter_dispatcher(self);
        (item.handler)(self, item.status);
    }

    fn finish_callback(&self) {
        let mut st = self.inner.state.lock();
        st.running -= 1;
        st.completed += 1;
        if !st.queue.is_empty() {
            if !self.is_unsynchronized() {
                self.schedule_locked(&mut st);
            }
        } else if st.observer_due() {
            self.schedule_locked(&mut st);
        }
        if st.is_idle() {
            self.inner.idle.notify_all();
        }
    }

    /// Runs at most one queued callback, or the shutdown observer once everything drained.
    /// Returns true if something ran.
    pub(crate) fn run_ticket(&self) -> bool {
        let mut st = self.inner.state.lock();
        if !self.is_unsynchronized() {
            st.ticket_posted = false;
            if st.running > 0 {
                return false;
            }
        }
        if let Some(item) = st.queue.pop_front() {
            st.running += 1;
            drop(st);
            let _running = RunningCallback(self);
            self.invoke(item);
            return true;
        }
        if st.observer_due() {
            self.run_observer(st);
            return true;
        }
        false
    }

    fn run_observer(&self, mut st: MutexGuard<'_, State>) {
        st.observer_started = true;
        st.lifecycle = DispatcherState::ShutDown;
        let observer = st.observer.take();
        drop(st);
        log::debug!("dispatcher {}: shut down", self.inner.name);
        let _done = ObserverDone(self);
        if let Some(observer) = observer {
            let _scope = thread_context::enter_dispatcher(self);
            observer(self);
        }
    }

    fn finish_observer(&self) {
        self.inner.state.lock().observer_done = true;
        self.inner.idle.notify_all();
        if let Some(runtime) = self.runtime() {
            runtime.on_dispatcher_shutdown(self);
        }
    }

    // ---- lifecycle -----------------------------------------------------------------------

    /// Starts shutdown. Idempotent: only the first call has any effect.
    ///
    /// Every queued callback and every registered wait is delivered `Canceled`; the observer
    /// runs once afterwards on a worker thread.
    pub fn shutdown_async(&self) {
        let mut st = self.inner.state.lock();
        if st.lifecycle != DispatcherState::Running {
            return;
        }
        st.lifecycle = DispatcherState::ShuttingDown;
        for queued in st.queue.iter_mut() {
            queued.status = Err(Status::Canceled);
        }
        let waits = core::mem::take(&mut st.waits);
        let canceled = waits.len();
        for (id, reg) in waits {
            st.queue.push_back(Queued {
                id,
                kind: reg.kind,
                handler: reg.handler,
                status: Err(Status::Canceled),
            });
        }
        log::debug!(
            "dispatcher {}: shutting down, {} waits canceled, {} callbacks queued",
            self.inner.name,
            canceled,
            st.queue.len()
        );
        if self.is_unsynchronized() {
            for _ in 0..canceled {
                self.schedule_locked(&mut st);
            }
            if st.observer_due() {
                self.schedule_locked(&mut st);
            }
        } else {
            self.schedule_locked(&mut st);
        }
    }

    /// Unregisters a dispatcher whose shutdown observer has fired.
    pub fn destroy(self) -> Result<()> {
        {
            let mut st = self.inner.state.lock();
            if st.lifecycle != DispatcherState::ShutDown {
                return Err(Status::BadState);
            }
            st.lifecycle = DispatcherState::Destroyed;
        }
        if self.allows_sync_calls() {
            if let Some(pool) = &self.inner.pool {
                pool.remove_sync_dispatcher();
            }
        }
        log::debug!("dispatcher {}: destroyed", self.inner.name);
        if let Some(runtime) = self.runtime() {
            runtime.on_dispatcher_destroyed(&self);
        }
        Ok(())
    }

    /// Permanently drops `ALLOW_SYNC_CALLS`; callable only from this dispatcher's callbacks.
    pub fn seal(&self, option: DispatcherOptions) -> Result<()> {
        if option != DispatcherOptions::ALLOW_SYNC_CALLS {
            return Err(Status::InvalidArgs);
        }
        if thread_context::current_dispatcher().as_ref() != Some(self) {
            return Err(Status::BadState);
        }
        let previous = self.inner.options.fetch_and(!option.bits(), Ordering::AcqRel);
        if previous & option.bits() == 0 {
            return Err(Status::InvalidArgs);
        }
        if let Some(pool) = &self.inner.pool {
            pool.remove_sync_dispatcher();
        }
        Ok(())
    }

    /// Blocks until the dispatcher is idle. Forbidden from the dispatcher's own callbacks.
    pub fn wait_until_idle(&self) -> Result<()> {
        if thread_context::is_dispatcher_in_call_stack(self) {
            return Err(Status::BadState);
        }
        let mut st = self.inner.state.lock();
        while !st.is_idle() {
            self.inner.idle.wait(&mut st);
        }
        Ok(())
    }

    pub(crate) fn wait_until_shut_down(&self) {
        let mut st = self.inner.state.lock();
        while !st.observer_done {
            self.inner.idle.wait(&mut st);
        }
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.inner.state.lock().observer_done
    }

    /// Human-readable state summary, one line per entry.
    pub fn dump(&self) -> Vec<String> {
        let st = self.inner.state.lock();
        let mut lines = vec![
            format!("---- dispatcher {} ({:#x}) ----", self.inner.name, self.inner.id),
            format!("owner: {}", self.inner.owner),
            format!("options: {:?}", self.options()),
            format!(
                "role: {}",
                if self.inner.role.is_empty() { "<default>" } else { self.inner.role.as_str() }
            ),
            format!("state: {:?}", st.lifecycle),
            format!("running: {}, completed: {}", st.running, st.completed),
            format!("registered waits: {}", st.waits.len()),
            format!("queued callbacks: {}", st.queue.len()),
        ];
        for (index, queued) in st.queue.iter().enumerate() {
            lines.push(format!("  [{index}] {:?} status={:?}", queued.kind, queued.status));
        }
        lines
    }

    /// Writes [`Dispatcher::dump`] to the log.
    pub fn log_dump(&self) {
        for line in self.dump() {
            log::info!("{line}");
        }
    }

    /// Event-loop-compatible view of this dispatcher.
    pub fn async_dispatcher(&self) -> &dyn AsyncDispatcher {
        self
    }
}

/// Completes a started callback even if its handler unwinds.
struct RunningCallback<'a>(&'a Dispatcher);

impl Drop for RunningCallback<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            log::warn!("dispatcher {}: callback panicked", self.0.inner.name);
        }
        self.0.finish_callback();
    }
}

struct ObserverDone<'a>(&'a Dispatcher);

impl Drop for ObserverDone<'_> {
    fn drop(&mut self) {
        self.0.finish_observer();
    }
}

/// Minimal event-loop interface used by code that only needs to post work.
pub trait AsyncDispatcher: Send + Sync {
    /// Queues `task` for immediate execution.
    fn post(&self, task: Box<dyn FnOnce(CallbackStatus) + Send + 'static>) -> Result<()>;

    /// Queues `task` for execution at `deadline`.
    fn post_at(
        &self,
        deadline: Instant,
        task: Box<dyn FnOnce(CallbackStatus) + Send + 'static>,
    ) -> Result<()>;

    /// Current time on the loop's clock.
    fn now(&self) -> Instant {
        Instant::now()
    }

    /// Recovers the runtime dispatcher behind this view, if there is one.
    fn as_dispatcher(&self) -> Option<&Dispatcher> {
        None
    }
}

impl AsyncDispatcher for Dispatcher {
    fn post(&self, task: Box<dyn FnOnce(CallbackStatus) + Send + 'static>) -> Result<()> {
        self.post_task(move |_, status| task(status)).map(|_| ())
    }

    fn post_at(
        &self,
        deadline: Instant,
        task: Box<dyn FnOnce(CallbackStatus) + Send + 'static>,
    ) -> Result<()> {
        self.post_task_at(deadline, move |_, status| task(status)).map(|_| ())
    }

    fn as_dispatcher(&self) -> Option<&Dispatcher> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn detached(options: DispatcherOptions) -> Dispatcher {
        Dispatcher::new(DispatcherParams {
            id: 7,
            owner: DriverId::new(),
            options,
            name: "unit".to_string(),
            role: String::new(),
            unmanaged: true,
            pool: None,
            runtime: Weak::new(),
            observer: Box::new(|_| {}),
        })
    }

    fn drain(dispatcher: &Dispatcher) {
        while dispatcher.run_ticket() {}
    }

    #[test]
    fn external_thread_signals_are_queued() {
        let dispatcher = detached(DispatcherOptions::empty());
        let id = dispatcher.register_wait(WaitKind::ChannelRead, Box::new(|_, _| {})).unwrap();
        assert!(dispatcher.signal_wait(id, Ok(()), true));
        assert_eq!(dispatcher.queue_len(), 1);
        assert!(!dispatcher.signal_wait(id, Ok(()), true));
        drain(&dispatcher);
        assert!(dispatcher.is_idle());
    }

    #[test]
    fn foreign_driver_frame_runs_inline() {
        let dispatcher = detached(DispatcherOptions::empty());
        let ran = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&ran);
        let id = dispatcher
            .register_wait(
                WaitKind::ChannelRead,
                Box::new(move |d, status| {
                    assert!(status.is_ok());
                    assert_eq!(thread_context::current_dispatcher().as_ref(), Some(d));
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        let _scope = thread_context::enter_driver(DriverId::new());
        dispatcher.signal_wait(id, Ok(()), true);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.queue_len(), 0);
    }

    #[test]
    fn owner_on_stack_forces_queueing() {
        let dispatcher = detached(DispatcherOptions::UNSYNCHRONIZED);
        let id = dispatcher.register_wait(WaitKind::ChannelRead, Box::new(|_, _| {})).unwrap();
        let _scope = thread_context::enter_driver(dispatcher.owner());
        dispatcher.signal_wait(id, Ok(()), true);
        assert_eq!(dispatcher.queue_len(), 1);
    }

    #[test]
    fn panicking_inline_handler_leaves_dispatcher_idle() {
        let dispatcher = detached(DispatcherOptions::empty());
        let id = dispatcher
            .register_wait(WaitKind::ChannelRead, Box::new(|_, _| panic!("handler failed")))
            .unwrap();
        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope = thread_context::enter_driver(DriverId::new());
            dispatcher.signal_wait(id, Ok(()), true);
        }));
        assert!(unwound.is_err());
        assert!(thread_context::is_call_stack_empty());
        assert!(dispatcher.is_idle());

        dispatcher.shutdown_async();
        drain(&dispatcher);
        assert_eq!(dispatcher.state(), DispatcherState::ShutDown);
    }

    #[test]
    fn shutdown_cancels_waits_then_runs_observer_once() {
        let observed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&observed);
        let dispatcher = Dispatcher::new(DispatcherParams {
            id: 9,
            owner: DriverId::new(),
            options: DispatcherOptions::empty(),
            name: "unit".to_string(),
            role: String::new(),
            unmanaged: true,
            pool: None,
            runtime: Weak::new(),
            observer: Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        });
        let statuses = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            let statuses = Arc::clone(&statuses);
            dispatcher
                .register_wait(
                    WaitKind::ChannelRead,
                    Box::new(move |_, status| statuses.lock().push(status)),
                )
                .unwrap();
        }
        dispatcher.shutdown_async();
        dispatcher.shutdown_async();
        assert_eq!(
            dispatcher.register_wait(WaitKind::ChannelRead, Box::new(|_, _| {})),
            Err(Status::Unavailable)
        );
        drain(&dispatcher);
        assert_eq!(*statuses.lock(), vec![Err(Status::Canceled); 3]);
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.state(), DispatcherState::ShutDown);
        assert!(dispatcher.clone().destroy().is_ok());
        assert_eq!(dispatcher.destroy(), Err(Status::BadState));
    }

    #[test]
    fn task_cancel_before_and_after_running() {
        let dispatcher = detached(DispatcherOptions::empty());
        let first = dispatcher.post_task(|_, _| panic!("canceled task ran")).unwrap();
        let second = dispatcher.post_task(|_, _| {}).unwrap();
        assert_eq!(first.cancel(), Ok(()));
        assert_eq!(first.cancel(), Err(Status::NotFound));
        drain(&dispatcher);
        assert_eq!(second.cancel(), Err(Status::NotFound));
    }

    #[test]
    fn sequence_id_only_on_own_synchronized_callbacks() {
        let unsync = detached(DispatcherOptions::UNSYNCHRONIZED);
        assert_eq!(unsync.sequence_id(), Err(Status::WrongType));
        let sync = detached(DispatcherOptions::empty());
        assert_eq!(sync.sequence_id(), Err(Status::BadState));
        let (tx, rx) = crossbeam_channel::bounded(1);
        sync.post_task(move |d, _| tx.send(d.sequence_id()).unwrap()).unwrap();
        drain(&sync);
        assert_eq!(rx.try_recv().unwrap(), Ok(SequenceId(7)));
    }

    #[test]
    fn dump_lists_queued_callbacks() {
        let dispatcher = detached(DispatcherOptions::empty());
        dispatcher.post_task(|_, _| {}).unwrap();
        let dump = dispatcher.dump();
        assert!(dump[0].contains("unit"));
        assert!(dump.iter().any(|line| line.contains("Task")));
    }
}
