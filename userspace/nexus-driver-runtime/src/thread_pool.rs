// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Elastic worker pool serving one scheduler role.
//!
//! The pool is a job queue plus a thread counter behind one lock. It grows by at most one
//! thread per `ALLOW_SYNC_CALLS` dispatcher registration, never beyond `max_threads`, and
//! never shrinks until [`ThreadPool::stop`].

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::status::{Result, Status};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    jobs: VecDeque<Job>,
    num_threads: u32,
    max_threads: u32,
    sync_dispatchers: u32,
    stopping: bool,
    workers: Vec<JoinHandle<()>>,
    spawned: u64,
}

pub(crate) struct ThreadPool {
    role: String,
    state: Mutex<PoolState>,
    work: Condvar,
}

impl ThreadPool {
    pub(crate) fn new(role: &str, max_threads: u32) -> Arc<Self> {
        Arc::new(Self {
            role: role.to_string(),
            state: Mutex::new(PoolState {
                jobs: VecDeque::new(),
                num_threads: 0,
                max_threads,
                sync_dispatchers: 0,
                stopping: false,
                workers: Vec::new(),
                spawned: 0,
            }),
            work: Condvar::new(),
        })
    }

    pub(crate) fn role(&self) -> &str {
        &self.role
    }

    pub(crate) fn num_threads(&self) -> u32 {
        self.state.lock().num_threads
    }

    pub(crate) fn max_threads(&self) -> u32 {
        self.state.lock().max_threads
    }

    #[cfg(test)]
    pub(crate) fn pending_jobs(&self) -> usize {
        self.state.lock().jobs.len()
    }

    /// Fails with [`Status::OutOfRange`] when `max` is below the running thread count.
    pub(crate) fn set_max_threads(&self, max: u32) -> Result<()> {
        let mut st = self.state.lock();
        if max < st.num_threads {
            return Err(Status::OutOfRange);
        }
        st.max_threads = max;
        Ok(())
    }

    pub(crate) fn post(&self, job: Job) {
        self.state.lock().jobs.push_back(job);
        self.work.notify_one();
    }

    /// Starts the first thread if the pool has none.
    pub(crate) fn ensure_started(self: &Arc<Self>) -> Result<()> {
        let mut st = self.state.lock();
        if st.num_threads == 0 {
            self.start_thread_locked(&mut st)?;
        }
        Ok(())
    }

    /// Accounts for a dispatcher that may block its worker, adding a thread when every
    /// existing one could be held by such dispatchers.
    pub(crate) fn add_sync_dispatcher(self: &Arc<Self>) -> Result<()> {
        let mut st = self.state.lock();
        st.sync_dispatchers += 1;
        let wanted = st.max_threads.min(st.sync_dispatchers.saturating_add(1));
        if st.num_threads < wanted {
            self.start_thread_locked(&mut st)?;
        }
        Ok(())
    }

    pub(crate) fn remove_sync_dispatcher(&self) {
        let mut st = self.state.lock();
        st.sync_dispatchers = st.sync_dispatchers.saturating_sub(1);
    }

    fn start_thread_locked(self: &Arc<Self>, st: &mut PoolState) -> Result<()> {
        if st.num_threads >= st.max_threads {
            return Err(Status::OutOfRange);
        }
        let role = if self.role.is_empty() { "default" } else { self.role.as_str() };
        let name = format!("drt-{role}-{}", st.spawned);
        let pool = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || pool.worker_loop())
            .map_err(|err| {
                log::warn!("thread pool {role}: cannot spawn {name}: {err}");
                Status::NoResources
            })?;
        st.workers.push(handle);
        st.num_threads += 1;
        st.spawned += 1;
        log::debug!("thread pool {role}: started {name} ({}/{})", st.num_threads, st.max_threads);
        Ok(())
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            let job = {
                let mut st = self.state.lock();
                loop {
                    if st.stopping {
                        return;
                    }
                    if let Some(job) = st.jobs.pop_front() {
                        break job;
                    }
                    self.work.wait(&mut st);
                }
            };
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                log::warn!("thread pool {}: job panicked, worker continues", self.role);
            }
        }
    }

    /// Stops and joins every worker. Queued jobs stay queued for the next thread.
    pub(crate) fn stop(&self) {
        let workers = {
            let mut st = self.state.lock();
            st.stopping = true;
            core::mem::take(&mut st.workers)
        };
        self.work.notify_all();
        let me = thread::current().id();
        for worker in workers {
            if worker.thread().id() == me {
                continue;
            }
            if worker.join().is_err() {
                log::warn!("thread pool {}: worker panicked", self.role);
            }
        }
        let mut st = self.state.lock();
        st.stopping = false;
        st.num_threads = 0;
        st.sync_dispatchers = 0;
    }
}
