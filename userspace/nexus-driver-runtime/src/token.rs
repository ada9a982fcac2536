// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Out-of-band channel delivery through token pairs.
//!
//! One side registers a handler against its token end; the other side transfers a channel
//! through the peer end. Whichever happens second queues the handler on the registered
//! dispatcher with the channel attached.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::dispatcher::{Dispatcher, WaitId, WaitKind};
use crate::status::{CallbackStatus, Result, Status};

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

/// Handler receiving a transferred channel.
pub type TokenHandler = Box<dyn FnOnce(&Dispatcher, CallbackStatus, Option<Channel>) + Send + 'static>;

/// One end of a token pair.
pub struct Token {
    id: u64,
}

impl Token {
    /// Creates two linked token ends.
    pub fn pair() -> (Token, Token) {
        let id = NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed);
        (Token { id }, Token { id })
    }

    /// Identity shared by both ends.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self.id)
    }
}

type Slot = Arc<Mutex<Option<Channel>>>;

enum Entry {
    Registered { dispatcher: Dispatcher, wait: WaitId, slot: Slot },
    Transferred(Channel),
}

#[derive(Default)]
pub(crate) struct TokenTable {
    entries: Mutex<HashMap<u64, Entry>>,
}

impl TokenTable {
    pub(crate) fn register(
        &self,
        token: &Token,
        dispatcher: &Dispatcher,
        handler: TokenHandler,
    ) -> Result<()> {
        let slot: Slot = Arc::new(Mutex::new(None));
        let delivered = Arc::clone(&slot);
        let wrapped = Box::new(move |d: &Dispatcher, status: CallbackStatus| {
            let channel = delivered.lock().take();
            handler(d, status, channel);
        });
        let mut entries = self.entries.lock();
        match entries.remove(&token.id) {
            Some(Entry::Registered { dispatcher: bound, wait, slot: bound_slot }) => {
                if bound.is_wait_pending(wait) {
                    entries.insert(
                        token.id,
                        Entry::Registered { dispatcher: bound, wait, slot: bound_slot },
                    );
                    return Err(Status::AlreadyBound);
                }
                let wait = dispatcher.register_wait(WaitKind::Token, wrapped)?;
                entries.insert(
                    token.id,
                    Entry::Registered { dispatcher: dispatcher.clone(), wait, slot },
                );
                Ok(())
            }
            Some(Entry::Transferred(channel)) => {
                let wait = match dispatcher.register_wait(WaitKind::Token, wrapped) {
                    Ok(wait) => wait,
                    Err(err) => {
                        entries.insert(token.id, Entry::Transferred(channel));
                        return Err(err);
                    }
                };
                drop(entries);
                *slot.lock() = Some(channel);
                dispatcher.signal_wait(wait, Ok(()), false);
                Ok(())
            }
            None => {
                let wait = dispatcher.register_wait(WaitKind::Token, wrapped)?;
                entries.insert(
                    token.id,
                    Entry::Registered { dispatcher: dispatcher.clone(), wait, slot },
                );
                Ok(())
            }
        }
    }

    pub(crate) fn transfer(&self, token: &Token, channel: Channel) -> Result<()> {
        let mut entries = self.entries.lock();
        match entries.remove(&token.id) {
            Some(Entry::Registered { dispatcher, wait, slot }) => {
                drop(entries);
                *slot.lock() = Some(channel);
                if !dispatcher.signal_wait(wait, Ok(()), false) {
                    // Registration was canceled by shutdown; the channel closes here.
                    let orphan = slot.lock().take();
                    drop(orphan);
                    log::debug!("token {}: registration gone, dropping channel", token.id);
                }
                Ok(())
            }
            Some(Entry::Transferred(pending)) => {
                entries.insert(token.id, Entry::Transferred(pending));
                drop(entries);
                drop(channel);
                Err(Status::BadState)
            }
            None => {
                entries.insert(token.id, Entry::Transferred(channel));
                Ok(())
            }
        }
    }
}
