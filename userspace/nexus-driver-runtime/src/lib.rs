// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Driver runtime: dispatchers, channels, arenas and the dispatcher coordinator
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + integration tests under tests/
//!
//! PUBLIC API:
//!   - Arena / Allocation: reference-counted bump arenas owning message payloads
//!   - Channel / Message / Handle: paired endpoints with write, read, wait_async, call
//!   - Dispatcher / DispatcherOptions / TaskHandle: per-driver scheduling contexts
//!   - Runtime / StartOptions: dispatcher registry, thread pools, driver shutdown, tokens
//!   - thread_context: per-thread driver call stack
//!   - Status / Result: error taxonomy with integer codes
//!
//! DEPENDENCIES:
//!   - nexus-alloc: segmented bump allocator behind Arena
//!   - parking_lot: locks and condition variables
//!   - crossbeam-channel: one-shot completion of synchronous calls
//!   - bitflags, thiserror, log, once_cell, serde + toml
//!
//! Callbacks signaled from a thread that is not already running the target driver may run
//! inline on that thread; everything else is queued for a worker. See [`dispatcher`] for the
//! exact rule.
//!
//! ADR: docs/adr/0003-driver-runtime-architecture.md

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

pub mod arena;
pub mod channel;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod runtime;
pub mod status;
pub mod thread_context;
mod thread_pool;
mod timer;
pub mod token;

pub use arena::{Allocation, Arena};
pub use channel::{Channel, Handle, Message, MAX_HANDLES, TXID_SIZE};
pub use cli::{execute, help, run};
pub use config::{ConfigError, RuntimeConfig};
pub use dispatcher::{
    AsyncDispatcher, Dispatcher, DispatcherOptions, DispatcherState, Handler, SequenceId,
    ShutdownObserver, TaskHandle,
};
pub use runtime::{DriverShutdownObserver, Runtime, StartOptions};
pub use status::{raw_status, CallbackStatus, Result, Status};
pub use thread_context::{DriverId, DriverScope};
pub use token::{Token, TokenHandler};
