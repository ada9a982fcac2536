// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Deadline service backing delayed tasks.
//!
//! One lazily spawned thread sleeps until the earliest deadline and fires the entry. Firing
//! only signals the owning dispatcher; callbacks never run on the timer thread.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::status::{Result, Status};

type Fire = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    deadline: Instant,
    seq: u64,
    fire: Fire,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
    thread: Option<JoinHandle<()>>,
    stopping: bool,
}

#[derive(Default)]
pub(crate) struct TimerService {
    state: Mutex<TimerState>,
    wake: Condvar,
}

impl TimerService {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Arms `fire` for `deadline`. Entries with equal deadlines fire in arming order.
    pub(crate) fn schedule(self: &Arc<Self>, deadline: Instant, fire: Fire) -> Result<()> {
        let mut st = self.state.lock();
        let seq = st.next_seq;
        st.next_seq += 1;
        st.heap.push(Reverse(Entry { deadline, seq, fire }));
        if st.thread.is_none() {
            let service = Arc::clone(self);
            let handle = thread::Builder::new()
                .name("drt-timer".to_string())
                .spawn(move || service.run())
                .map_err(|err| {
                    log::warn!("timer: cannot spawn thread: {err}");
                    Status::NoResources
                })?;
            st.thread = Some(handle);
        }
        drop(st);
        self.wake.notify_one();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn armed(&self) -> usize {
        self.state.lock().heap.len()
    }

    fn run(self: Arc<Self>) {
        let mut st = self.state.lock();
        loop {
            if st.stopping {
                return;
            }
            let next = st.heap.peek().map(|Reverse(entry)| entry.deadline);
            match next {
                None => self.wake.wait(&mut st),
                Some(deadline) if deadline <= Instant::now() => {
                    if let Some(Reverse(entry)) = st.heap.pop() {
                        drop(st);
                        (entry.fire)();
                        st = self.state.lock();
                    }
                }
                Some(deadline) => {
                    self.wake.wait_until(&mut st, deadline);
                }
            }
        }
    }

    /// Stops the timer thread. Armed entries are dropped without firing.
    pub(crate) fn stop(&self) {
        let handle = {
            let mut st = self.state.lock();
            st.stopping = true;
            st.heap.clear();
            st.thread.take()
        };
        self.wake.notify_all();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                log::warn!("timer: thread panicked");
            }
        }
        self.state.lock().stopping = false;
    }
}
