// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Bidirectional message channels between driver execution contexts
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + tests/channel.rs
//!
//! Both endpoints of a pair share one lock. Writes never block: a message either completes an
//! outstanding [`Channel::call`] with the same transaction id, or is buffered on the peer and
//! signals the peer's pending read through its dispatcher. The dispatcher is always signaled
//! after the pair lock is released, so a handler running inline may use the channel freely.
//!
//! Lock order: pair lock, then dispatcher lock.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::arena::{Allocation, Arena};
use crate::dispatcher::{Dispatcher, WaitId, WaitKind};
use crate::status::{CallbackStatus, Result, Status};
use crate::thread_context;
use crate::token::Token;

/// Maximum capabilities attached to one message.
pub const MAX_HANDLES: usize = 64;

/// Size of the transaction id prefix written by [`Channel::call`].
pub const TXID_SIZE: usize = 4;

// Ids allocated by end1 carry the high bit, so the two ends never hand out the same id.
const TXID_END1: u32 = 1 << 31;

static NEXT_PAIR_ID: AtomicU64 = AtomicU64::new(1);

/// Capability carried alongside message bytes.
#[derive(Debug)]
pub enum Handle {
    /// A channel endpoint.
    Channel(Channel),
    /// A token end.
    Token(Token),
}

/// A message read from a channel: bytes owned by an arena plus capabilities.
#[derive(Debug, Default)]
pub struct Message {
    arena: Option<Arena>,
    data: Option<Allocation>,
    handles: Vec<Handle>,
}

impl Message {
    /// Arena that owns the payload.
    pub fn arena(&self) -> Option<&Arena> {
        self.arena.as_ref()
    }

    /// Payload allocation inside [`Message::arena`].
    pub fn data(&self) -> Option<&Allocation> {
        self.data.as_ref()
    }

    /// Attached capabilities.
    pub fn handles(&self) -> &[Handle] {
        &self.handles
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.as_ref().map_or(0, Allocation::len)
    }

    /// True for zero-byte payloads.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the payload bytes.
    pub fn bytes(&self) -> Vec<u8> {
        match (&self.arena, &self.data) {
            (Some(arena), Some(data)) => arena.read(data).unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Transaction id in the first four payload bytes, if the payload is long enough.
    pub fn txid(&self) -> Option<u32> {
        let (arena, data) = (self.arena.as_ref()?, self.data.as_ref()?);
        if data.len() < TXID_SIZE {
            return None;
        }
        arena
            .with_bytes(data, |bytes| {
                let mut raw = [0u8; TXID_SIZE];
                raw.copy_from_slice(&bytes[..TXID_SIZE]);
                u32::from_le_bytes(raw)
            })
            .ok()
    }

    /// Splits the message into arena, payload and capabilities.
    pub fn into_parts(self) -> (Option<Arena>, Option<Allocation>, Vec<Handle>) {
        (self.arena, self.data, self.handles)
    }
}

struct ReadWait {
    dispatcher: Dispatcher,
    wait: WaitId,
}

struct EndpointState {
    open: bool,
    messages: VecDeque<Message>,
    read_wait: Option<ReadWait>,
    calls: HashMap<u32, Sender<Result<Message>>>,
    next_txid: u32,
    txid_tag: u32,
}

impl EndpointState {
    fn new(side: usize) -> Self {
        Self {
            open: true,
            messages: VecDeque::new(),
            read_wait: None,
            calls: HashMap::new(),
            next_txid: 1,
            txid_tag: if side == 0 { 0 } else { TXID_END1 },
        }
    }

    fn allocate_txid(&mut self) -> u32 {
        loop {
            let txid = (self.next_txid & !TXID_END1) | self.txid_tag;
            self.next_txid = self.next_txid.wrapping_add(1);
            if txid != 0 && !self.calls.contains_key(&txid) {
                return txid;
            }
        }
    }
}

struct PairShared {
    id: u64,
    ends: Mutex<[EndpointState; 2]>,
}

struct Endpoint {
    pair: Arc<PairShared>,
    side: usize,
}

impl Endpoint {
    fn peer(&self) -> usize {
        1 - self.side
    }

    fn close(&self) {
        let (own_wait, peer_wait, own_calls, peer_calls, discarded) = {
            let mut ends = self.pair.ends.lock();
            let own = &mut ends[self.side];
            if !own.open {
                return;
            }
            own.open = false;
            let discarded = core::mem::take(&mut own.messages);
            let own_wait = own.read_wait.take();
            let own_calls = core::mem::take(&mut own.calls);
            let peer = &mut ends[self.peer()];
            (own_wait, peer.read_wait.take(), own_calls, core::mem::take(&mut peer.calls), discarded)
        };
        for (_, reply) in own_calls {
            let _ = reply.send(Err(Status::Canceled));
        }
        for (_, reply) in peer_calls {
            let _ = reply.send(Err(Status::PeerClosed));
        }
        if let Some(wait) = own_wait {
            let _ = wait.dispatcher.cancel_wait(wait.wait);
        }
        if let Some(wait) = peer_wait {
            wait.dispatcher.signal_wait(wait.wait, Err(Status::Canceled), true);
        }
        drop(discarded);
        log::trace!("channel {}: end{} closed", self.pair.id, self.side);
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}

/// One endpoint of a channel pair. Clones share the endpoint; the last one closes it.
#[derive(Clone)]
pub struct Channel {
    end: Arc<Endpoint>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Channel({}:{})", self.end.pair.id, self.end.side)
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.end, &other.end)
    }
}

impl Eq for Channel {}

impl Channel {
    /// Creates a connected pair. `options` is reserved and must be zero.
    pub fn create(options: u32) -> Result<(Channel, Channel)> {
        if options != 0 {
            return Err(Status::InvalidArgs);
        }
        Ok(Self::pair())
    }

    /// Creates a connected pair.
    pub fn pair() -> (Channel, Channel) {
        let pair = Arc::new(PairShared {
            id: NEXT_PAIR_ID.fetch_add(1, Ordering::Relaxed),
            ends: Mutex::new([EndpointState::new(0), EndpointState::new(1)]),
        });
        let end = |side| Channel { end: Arc::new(Endpoint { pair: Arc::clone(&pair), side }) };
        (end(0), end(1))
    }

    /// True until [`Channel::close`] runs on this endpoint.
    pub fn is_open(&self) -> bool {
        self.end.pair.ends.lock()[self.end.side].open
    }

    /// Number of messages buffered for reading on this endpoint.
    pub fn pending_messages(&self) -> usize {
        self.end.pair.ends.lock()[self.end.side].messages.len()
    }

    /// Sends `data` (allocated from `arena`) and `handles` to the peer. Never blocks.
    pub fn write(
        &self,
        options: u32,
        arena: Option<&Arena>,
        data: Option<Allocation>,
        handles: Vec<Handle>,
    ) -> Result<()> {
        if options != 0 || handles.len() > MAX_HANDLES {
            return Err(Status::InvalidArgs);
        }
        match (arena, &data) {
            (None, Some(_)) => return Err(Status::InvalidArgs),
            (None, None) if !handles.is_empty() => return Err(Status::InvalidArgs),
            (Some(arena), Some(data)) if !arena.owns(data) => return Err(Status::InvalidArgs),
            _ => {}
        }
        if handles.iter().any(|h| matches!(h, Handle::Channel(c) if Arc::ptr_eq(&c.end, &self.end))) {
            return Err(Status::NotSupported);
        }
        self.deliver(Message { arena: arena.cloned(), data, handles })
    }

    /// Copies `bytes` into a fresh arena and writes them.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        let arena = Arena::new(0);
        let data = arena.copy_from(bytes)?;
        self.write(0, Some(&arena), Some(data), Vec::new())
    }

    fn deliver(&self, message: Message) -> Result<()> {
        let mut ends = self.end.pair.ends.lock();
        if !ends[self.end.side].open {
            return Err(Status::BadState);
        }
        let peer = &mut ends[self.end.peer()];
        if !peer.open {
            return Err(Status::PeerClosed);
        }
        if let Some(reply) = message.txid().and_then(|txid| peer.calls.remove(&txid)) {
            drop(ends);
            let _ = reply.send(Ok(message));
            return Ok(());
        }
        peer.messages.push_back(message);
        let wake = peer.read_wait.as_ref().map(|w| (w.dispatcher.clone(), w.wait));
        drop(ends);
        if let Some((dispatcher, wait)) = wake {
            dispatcher.signal_wait(wait, Ok(()), true);
        }
        Ok(())
    }

    /// Pops one buffered message.
    ///
    /// [`Status::ShouldWait`] if nothing is buffered, [`Status::PeerClosed`] if nothing is
    /// buffered and nothing ever will be.
    pub fn read(&self, options: u32) -> Result<Message> {
        if options != 0 {
            return Err(Status::InvalidArgs);
        }
        let mut ends = self.end.pair.ends.lock();
        if !ends[self.end.side].open {
            return Err(Status::BadState);
        }
        if let Some(message) = ends[self.end.side].messages.pop_front() {
            return Ok(message);
        }
        if ends[self.end.peer()].open {
            Err(Status::ShouldWait)
        } else {
            Err(Status::PeerClosed)
        }
    }

    /// Registers the endpoint's single pending read on `dispatcher`.
    ///
    /// The handler runs once: `Ok(())` when a message is readable, `Canceled` on cancel,
    /// close or dispatcher shutdown.
    pub fn wait_async(
        &self,
        dispatcher: &Dispatcher,
        options: u32,
        handler: impl FnOnce(&Dispatcher, CallbackStatus) + Send + 'static,
    ) -> Result<()> {
        if options != 0 {
            return Err(Status::InvalidArgs);
        }
        let mut ends = self.end.pair.ends.lock();
        let peer_open = ends[self.end.peer()].open;
        let own = &mut ends[self.end.side];
        if !own.open {
            return Err(Status::BadState);
        }
        if let Some(existing) = &own.read_wait {
            if existing.dispatcher.is_wait_pending(existing.wait) {
                return Err(Status::AlreadyBound);
            }
        }
        if own.messages.is_empty() && !peer_open {
            return Err(Status::PeerClosed);
        }
        let wait = dispatcher.register_wait(WaitKind::ChannelRead, Box::new(handler))?;
        own.read_wait = Some(ReadWait { dispatcher: dispatcher.clone(), wait });
        let readable = !own.messages.is_empty();
        drop(ends);
        if readable {
            dispatcher.signal_wait(wait, Ok(()), true);
        }
        Ok(())
    }

    /// Withdraws the pending read; its handler is delivered `Canceled`.
    pub fn cancel_wait(&self) -> Result<()> {
        let wait = self.end.pair.ends.lock()[self.end.side].read_wait.take();
        let wait = wait.ok_or(Status::NotFound)?;
        wait.dispatcher.cancel_wait(wait.wait)
    }

    /// Closes this endpoint for every clone of the handle.
    pub fn close(&self) {
        self.end.close();
    }

    /// Writes a request and blocks until the reply with the same transaction id arrives.
    ///
    /// The first [`TXID_SIZE`] bytes of `data` are overwritten with the transaction id.
    /// Fails with [`Status::BadState`] on a dispatcher without `ALLOW_SYNC_CALLS`,
    /// [`Status::TimedOut`] at `deadline`, [`Status::PeerClosed`] if the peer goes away and
    /// [`Status::Canceled`] if this endpoint is closed meanwhile.
    pub fn call(
        &self,
        options: u32,
        deadline: Option<Instant>,
        arena: &Arena,
        data: Allocation,
        handles: Vec<Handle>,
    ) -> Result<Message> {
        if options != 0 {
            return Err(Status::InvalidArgs);
        }
        if thread_context::current_dispatcher().is_some_and(|d| !d.allows_sync_calls()) {
            return Err(Status::BadState);
        }
        if data.len() < TXID_SIZE || !arena.owns(&data) {
            return Err(Status::InvalidArgs);
        }
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let txid = {
            let mut ends = self.end.pair.ends.lock();
            if !ends[self.end.side].open {
                return Err(Status::BadState);
            }
            if !ends[self.end.peer()].open {
                return Err(Status::PeerClosed);
            }
            let own = &mut ends[self.end.side];
            let txid = own.allocate_txid();
            own.calls.insert(txid, reply_tx);
            txid
        };
        let stamped = arena
            .with_bytes_mut(&data, |bytes| bytes[..TXID_SIZE].copy_from_slice(&txid.to_le_bytes()))
            .and_then(|()| self.write(0, Some(arena), Some(data), handles));
        if let Err(err) = stamped {
            self.withdraw_call(txid);
            return Err(err);
        }
        let outcome = match deadline {
            Some(deadline) => reply_rx.recv_deadline(deadline),
            None => reply_rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match outcome {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => {
                self.withdraw_call(txid);
                // A reply may have landed between the timeout and the withdrawal.
                reply_rx.try_recv().unwrap_or(Err(Status::TimedOut))
            }
            Err(RecvTimeoutError::Disconnected) => Err(Status::Canceled),
        }
    }

    fn withdraw_call(&self, txid: u32) {
        self.end.pair.ends.lock()[self.end.side].calls.remove(&txid);
    }

    #[cfg(test)]
    pub(crate) fn outstanding_calls(&self) -> usize {
        self.end.pair.ends.lock()[self.end.side].calls.len()
    }
}
