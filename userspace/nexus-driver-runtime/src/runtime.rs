// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Dispatcher coordinator: registry of dispatchers by driver, role thread pools, timers and
//! tokens.
//!
//! A [`Runtime`] is self-contained; tests create their own instance while production code
//! uses [`Runtime::global`].

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

use crate::channel::Channel;
use crate::config::RuntimeConfig;
use crate::dispatcher::{Dispatcher, DispatcherOptions, DispatcherParams};
use crate::status::{CallbackStatus, Result, Status};
use crate::thread_context::{self, DriverId};
use crate::thread_pool::ThreadPool;
use crate::timer::TimerService;
use crate::token::{Token, TokenTable};

bitflags! {
    /// Options accepted by [`Runtime::start`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct StartOptions: u32 {
        /// Reject dispatchers whose scheduler role was not allowed for their driver.
        const ENFORCE_ALLOWED_SCHEDULER_ROLES = 1 << 0;
    }
}

/// Callback run once every dispatcher of a driver has shut down.
pub type DriverShutdownObserver = Box<dyn FnOnce(DriverId) + Send + 'static>;

#[derive(Default)]
struct DriverEntry {
    dispatchers: Vec<Dispatcher>,
    shut_down: HashSet<u64>,
    shutting_down: bool,
    observer: Option<DriverShutdownObserver>,
}

impl DriverEntry {
    fn all_shut_down(&self) -> bool {
        self.dispatchers.iter().all(|d| self.shut_down.contains(&d.id()))
    }
}

#[derive(Default)]
struct Registry {
    drivers: HashMap<DriverId, DriverEntry>,
    live: usize,
}

pub(crate) struct RuntimeInner {
    config: RuntimeConfig,
    pools: Mutex<HashMap<String, Arc<ThreadPool>>>,
    registry: Mutex<Registry>,
    registry_changed: Condvar,
    timers: Arc<TimerService>,
    tokens: TokenTable,
    allowed_roles: Mutex<HashMap<DriverId, HashSet<String>>>,
    enforce_roles: AtomicBool,
    next_dispatcher: AtomicU64,
}

impl RuntimeInner {
    pub(crate) fn timers(&self) -> &Arc<TimerService> {
        &self.timers
    }

    fn pool_for_role(&self, role: &str) -> Arc<ThreadPool> {
        let mut pools = self.pools.lock();
        Arc::clone(
            pools
                .entry(role.to_string())
                .or_insert_with(|| ThreadPool::new(role, self.config.limit_for_role(role))),
        )
    }

    pub(crate) fn on_dispatcher_shutdown(&self, dispatcher: &Dispatcher) {
        let owner = dispatcher.owner();
        let observer = {
            let mut registry = self.registry.lock();
            let mut observer = None;
            let mut remove = false;
            if let Some(entry) = registry.drivers.get_mut(&owner) {
                if entry.dispatchers.iter().any(|d| d == dispatcher) {
                    entry.shut_down.insert(dispatcher.id());
                }
                if entry.shutting_down && entry.all_shut_down() {
                    entry.shutting_down = false;
                    observer = entry.observer.take();
                    remove = entry.dispatchers.is_empty();
                }
            }
            if remove {
                registry.drivers.remove(&owner);
            }
            observer
        };
        self.registry_changed.notify_all();
        if let Some(observer) = observer {
            log::debug!("runtime: all dispatchers of {owner} shut down");
            observer(owner);
        }
    }

    pub(crate) fn on_dispatcher_destroyed(&self, dispatcher: &Dispatcher) {
        let owner = dispatcher.owner();
        {
            let mut registry = self.registry.lock();
            let mut remove = false;
            let mut found = false;
            if let Some(entry) = registry.drivers.get_mut(&owner) {
                let before = entry.dispatchers.len();
                entry.dispatchers.retain(|d| d != dispatcher);
                entry.shut_down.remove(&dispatcher.id());
                found = entry.dispatchers.len() != before;
                remove = entry.dispatchers.is_empty() && !entry.shutting_down;
            }
            if remove {
                registry.drivers.remove(&owner);
            }
            if found {
                registry.live -= 1;
            }
        }
        self.registry_changed.notify_all();
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        for pool in self.pools.get_mut().values() {
            pool.stop();
        }
        self.timers.stop();
    }
}

/// Handle to one runtime instance.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

static GLOBAL: Lazy<Runtime> = Lazy::new(|| {
    let config = RuntimeConfig::from_env().unwrap_or_else(|err| {
        log::warn!("runtime: invalid configuration, using defaults: {err}");
        RuntimeConfig::default()
    });
    let start = config.start_threads;
    let runtime = Runtime::new(config);
    if start {
        if let Err(err) = runtime.start(StartOptions::empty()) {
            log::warn!("runtime: cannot start default pool: {err}");
        }
    }
    runtime
});

impl Runtime {
    /// Creates a runtime with no running threads; call [`Runtime::start`] next.
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                pools: Mutex::new(HashMap::new()),
                registry: Mutex::new(Registry::default()),
                registry_changed: Condvar::new(),
                timers: TimerService::new(),
                tokens: TokenTable::default(),
                allowed_roles: Mutex::new(HashMap::new()),
                enforce_roles: AtomicBool::new(false),
                next_dispatcher: AtomicU64::new(1),
            }),
        }
    }

    /// Process-wide runtime configured from the environment.
    pub fn global() -> &'static Runtime {
        &GLOBAL
    }

    /// Configuration this runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Brings the default pool to at least one thread.
    pub fn start(&self, options: StartOptions) -> Result<()> {
        self.inner.enforce_roles.store(
            options.contains(StartOptions::ENFORCE_ALLOWED_SCHEDULER_ROLES),
            Ordering::Release,
        );
        self.inner.pool_for_role("").ensure_started()
    }

    /// Stops every worker and timer thread. Requires that no dispatcher exists.
    pub fn reset(&self) -> Result<()> {
        if self.inner.registry.lock().live > 0 {
            return Err(Status::BadState);
        }
        let pools: Vec<Arc<ThreadPool>> = {
            let mut pools = self.inner.pools.lock();
            pools.retain(|role, _| role.is_empty());
            pools.values().cloned().collect()
        };
        for pool in pools {
            pool.stop();
        }
        self.inner.timers.stop();
        self.inner.enforce_roles.store(false, Ordering::Release);
        log::debug!("runtime: reset");
        Ok(())
    }

    // ---- dispatcher creation -------------------------------------------------------------

    /// Creates a dispatcher owned by the driver on top of the calling thread's stack.
    pub fn create_dispatcher(
        &self,
        options: DispatcherOptions,
        name: &str,
        scheduler_role: &str,
        observer: impl FnOnce(&Dispatcher) + Send + 'static,
    ) -> Result<Dispatcher> {
        let owner = thread_context::current_driver().ok_or(Status::BadState)?;
        self.create(owner, options, name, scheduler_role, Box::new(observer), false)
    }

    /// Creates a dispatcher for an explicit owner.
    pub fn create_dispatcher_with_owner(
        &self,
        owner: DriverId,
        options: DispatcherOptions,
        name: &str,
        scheduler_role: &str,
        observer: impl FnOnce(&Dispatcher) + Send + 'static,
    ) -> Result<Dispatcher> {
        self.create(owner, options, name, scheduler_role, Box::new(observer), false)
    }

    /// Creates a dispatcher without worker threads, drained by [`Runtime::run_until_idle`].
    pub fn create_unmanaged_dispatcher(
        &self,
        owner: DriverId,
        options: DispatcherOptions,
        name: &str,
        observer: impl FnOnce(&Dispatcher) + Send + 'static,
    ) -> Result<Dispatcher> {
        self.create(owner, options, name, "", Box::new(observer), true)
    }

    fn create(
        &self,
        owner: DriverId,
        options: DispatcherOptions,
        name: &str,
        role: &str,
        observer: Box<dyn FnOnce(&Dispatcher) + Send + 'static>,
        unmanaged: bool,
    ) -> Result<Dispatcher> {
        if options.contains(DispatcherOptions::UNSYNCHRONIZED | DispatcherOptions::ALLOW_SYNC_CALLS)
        {
            return Err(Status::InvalidArgs);
        }
        if self.inner.enforce_roles.load(Ordering::Acquire)
            && !role.is_empty()
            && !self.inner.allowed_roles.lock().get(&owner).is_some_and(|roles| roles.contains(role))
        {
            return Err(Status::AccessDenied);
        }
        let pool = if unmanaged { None } else { Some(self.inner.pool_for_role(role)) };
        let dispatcher = Dispatcher::new(DispatcherParams {
            id: self.inner.next_dispatcher.fetch_add(1, Ordering::Relaxed),
            owner,
            options,
            name: name.to_string(),
            role: role.to_string(),
            unmanaged,
            pool: pool.clone(),
            runtime: Arc::downgrade(&self.inner),
            observer,
        });
        {
            let mut registry = self.inner.registry.lock();
            if registry.drivers.get(&owner).is_some_and(|entry| entry.shutting_down) {
                return Err(Status::BadState);
            }
            registry.drivers.entry(owner).or_default().dispatchers.push(dispatcher.clone());
            registry.live += 1;
        }
        if let Some(pool) = pool {
            // The base thread comes first so a blocking dispatcher still gets its extra one.
            if !role.is_empty() {
                if let Err(err) = pool.ensure_started() {
                    log::warn!("runtime: role pool {} has no thread: {err}", pool.role());
                }
            }
            if options.contains(DispatcherOptions::ALLOW_SYNC_CALLS) {
                if let Err(err) = pool.add_sync_dispatcher() {
                    log::warn!("runtime: no extra thread for {name}: {err}");
                }
            }
        }
        log::debug!("runtime: created dispatcher {name} for {owner} ({options:?})");
        Ok(dispatcher)
    }

    // ---- driver shutdown -----------------------------------------------------------------

    /// Shuts down every dispatcher of `driver`; `observer` runs once all have shut down.
    ///
    /// If they already were, the observer runs before this returns.
    pub fn shutdown_dispatchers_async(
        &self,
        driver: DriverId,
        observer: impl FnOnce(DriverId) + Send + 'static,
    ) -> Result<()> {
        let dispatchers = {
            let mut registry = self.inner.registry.lock();
            let entry = registry.drivers.get_mut(&driver).ok_or(Status::InvalidArgs)?;
            if entry.shutting_down {
                return Err(Status::BadState);
            }
            entry.shutting_down = true;
            entry.observer = Some(Box::new(observer));
            entry.dispatchers.clone()
        };
        for dispatcher in &dispatchers {
            dispatcher.shutdown_async();
        }
        let ready = {
            let mut registry = self.inner.registry.lock();
            let mut ready = None;
            let mut remove = false;
            if let Some(entry) = registry.drivers.get_mut(&driver) {
                for dispatcher in &entry.dispatchers {
                    if dispatcher.is_shut_down() {
                        entry.shut_down.insert(dispatcher.id());
                    }
                }
                if entry.shutting_down && entry.all_shut_down() {
                    entry.shutting_down = false;
                    ready = entry.observer.take();
                    remove = entry.dispatchers.is_empty();
                }
            }
            if remove {
                registry.drivers.remove(&driver);
            }
            ready
        };
        if let Some(observer) = ready {
            observer(driver);
        }
        Ok(())
    }

    /// Shuts down and destroys every dispatcher, then waits until all are gone.
    ///
    /// Must not be called from a driver callback.
    pub fn destroy_all_dispatchers(&self) -> Result<()> {
        if !thread_context::is_call_stack_empty() {
            return Err(Status::BadState);
        }
        let all = self.dispatchers();
        for dispatcher in &all {
            dispatcher.shutdown_async();
        }
        self.run_until_idle();
        for dispatcher in &all {
            if !dispatcher.is_unmanaged() {
                dispatcher.wait_until_shut_down();
            }
        }
        for dispatcher in all {
            if let Err(err) = dispatcher.clone().destroy() {
                log::trace!("runtime: {} already destroyed: {err}", dispatcher.name());
            }
        }
        self.wait_until_dispatchers_destroyed();
        Ok(())
    }

    // ---- waiting -------------------------------------------------------------------------

    /// Blocks until every managed dispatcher is idle.
    pub fn wait_until_dispatchers_idle(&self) -> Result<()> {
        if !thread_context::is_call_stack_empty() {
            return Err(Status::BadState);
        }
        for dispatcher in self.dispatchers().iter().filter(|d| !d.is_unmanaged()) {
            dispatcher.wait_until_idle()?;
        }
        Ok(())
    }

    /// Blocks until every dispatcher has been destroyed.
    pub fn wait_until_dispatchers_destroyed(&self) {
        let mut registry = self.inner.registry.lock();
        while registry.live > 0 {
            self.inner.registry_changed.wait(&mut registry);
        }
    }

    /// Drains unmanaged dispatchers on the calling thread until none has work left.
    pub fn run_until_idle(&self) {
        loop {
            let mut progress = false;
            for dispatcher in self.dispatchers().iter().filter(|d| d.is_unmanaged()) {
                while dispatcher.run_ticket() {
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }
    }

    /// Every dispatcher not yet destroyed.
    pub fn dispatchers(&self) -> Vec<Dispatcher> {
        let registry = self.inner.registry.lock();
        registry.drivers.values().flat_map(|entry| entry.dispatchers.iter().cloned()).collect()
    }

    /// Dispatchers owned by `driver`.
    pub fn dispatchers_of(&self, driver: DriverId) -> Vec<Dispatcher> {
        let registry = self.inner.registry.lock();
        registry.drivers.get(&driver).map(|entry| entry.dispatchers.clone()).unwrap_or_default()
    }

    // ---- thread limits -------------------------------------------------------------------

    /// Maximum threads of the pool serving `role` (empty for the default pool).
    pub fn thread_limit(&self, role: &str) -> u32 {
        let existing = self.inner.pools.lock().get(role).cloned();
        match existing {
            Some(pool) => pool.max_threads(),
            None => self.inner.config.limit_for_role(role),
        }
    }

    /// Sets the thread cap of `role`; fails with [`Status::OutOfRange`] below the current count.
    pub fn set_thread_limit(&self, role: &str, max_threads: u32) -> Result<()> {
        self.inner.pool_for_role(role).set_max_threads(max_threads)
    }

    /// Threads currently running in the pool serving `role`.
    pub fn num_threads(&self, role: &str) -> u32 {
        let existing = self.inner.pools.lock().get(role).cloned();
        existing.map_or(0, |pool| pool.num_threads())
    }

    /// Allows `driver` to create dispatchers with `role` under role enforcement.
    pub fn add_allowed_scheduler_role(&self, driver: DriverId, role: &str) {
        self.inner.allowed_roles.lock().entry(driver).or_default().insert(role.to_string());
    }

    // ---- tokens --------------------------------------------------------------------------

    /// Registers `handler` to receive the channel transferred through the peer of `token`.
    pub fn token_register(
        &self,
        token: &Token,
        dispatcher: &Dispatcher,
        handler: impl FnOnce(&Dispatcher, CallbackStatus, Option<Channel>) + Send + 'static,
    ) -> Result<()> {
        self.inner.tokens.register(token, dispatcher, Box::new(handler))
    }

    /// Delivers `channel` to whoever registered the peer of `token`.
    pub fn token_transfer(&self, token: &Token, channel: Channel) -> Result<()> {
        self.inner.tokens.transfer(token, channel)
    }
}
