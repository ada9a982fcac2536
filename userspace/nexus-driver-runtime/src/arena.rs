// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Reference-counted arenas owning message payloads.
//!
//! An [`Arena`] is a shared handle: cloning it adds a reference, dropping it releases one, and
//! the backing segments are freed with the last reference. Payloads are described by
//! [`Allocation`] values that are only meaningful for the arena that produced them.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nexus_alloc::{SegmentedBump, Span, DEFAULT_ALIGN, DEFAULT_SEGMENT_SIZE};
use parking_lot::RwLock;

use crate::status::{Result, Status};

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a region carved out of an [`Arena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Allocation {
    arena_id: u64,
    span: Span,
}

impl Allocation {
    /// Length in bytes.
    pub const fn len(&self) -> usize {
        self.span.len()
    }

    /// Returns true for zero-length allocations.
    pub const fn is_empty(&self) -> bool {
        self.span.is_empty()
    }
}

struct ArenaInner {
    id: u64,
    tag: u32,
    bump: RwLock<SegmentedBump>,
}

impl Drop for ArenaInner {
    fn drop(&mut self) {
        log::trace!("arena {:#x}: released {} bytes", self.tag, self.bump.get_mut().reserved());
    }
}

/// Shared bump arena. `Clone` is add-ref, `Drop` is release.
#[derive(Clone)]
pub struct Arena {
    inner: Arc<ArenaInner>,
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("tag", &self.inner.tag)
            .field("refs", &self.ref_count())
            .finish()
    }
}

impl PartialEq for Arena {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Arena {}

impl Arena {
    /// Creates an empty arena. `options` is reserved and must be zero.
    pub fn create(options: u32, tag: u32) -> Result<Self> {
        if options != 0 {
            return Err(Status::InvalidArgs);
        }
        Ok(Self::new(tag))
    }

    /// Creates an empty arena with the given tag.
    pub fn new(tag: u32) -> Self {
        Self {
            inner: Arc::new(ArenaInner {
                id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
                tag,
                bump: RwLock::new(SegmentedBump::new(DEFAULT_SEGMENT_SIZE)),
            }),
        }
    }

    /// Opaque tag supplied at creation.
    pub fn tag(&self) -> u32 {
        self.inner.tag
    }

    /// Number of live references (handles plus in-flight messages).
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Adds a reference; equivalent to `clone`.
    pub fn add_ref(&self) -> Self {
        self.clone()
    }

    /// Releases this reference; backing storage goes away with the last one.
    pub fn destroy(self) {
        drop(self);
    }

    /// Carves `len` zero-initialized bytes, growing the arena if needed.
    pub fn allocate(&self, len: usize) -> Result<Allocation> {
        let span = self.inner.bump.write().alloc(len, DEFAULT_ALIGN)?;
        Ok(Allocation { arena_id: self.inner.id, span })
    }

    /// Allocates and fills a region with `bytes`.
    pub fn copy_from(&self, bytes: &[u8]) -> Result<Allocation> {
        let mut bump = self.inner.bump.write();
        let span = bump.alloc(bytes.len(), DEFAULT_ALIGN)?;
        bump.bytes_mut(&span).ok_or(Status::Internal)?.copy_from_slice(bytes);
        Ok(Allocation { arena_id: self.inner.id, span })
    }

    /// Bookkeeping hint only; memory is reclaimed when the arena is released.
    pub fn free(&self, allocation: &Allocation) {
        log::trace!("arena {:#x}: free hint for {} bytes", self.inner.tag, allocation.len());
    }

    /// Returns true if `allocation` was carved from this arena.
    pub fn owns(&self, allocation: &Allocation) -> bool {
        allocation.arena_id == self.inner.id && self.inner.bump.read_recursive().owns(&allocation.span)
    }

    /// Returns true if the byte range `data` lies entirely within memory this arena handed out.
    pub fn contains(&self, data: &[u8]) -> bool {
        self.contains_addr(data.as_ptr() as usize, data.len())
    }

    /// Address-based variant of [`Arena::contains`].
    pub fn contains_addr(&self, addr: usize, len: usize) -> bool {
        self.inner.bump.read_recursive().contains_addr(addr, len)
    }

    /// Runs `f` over the bytes of `allocation`.
    pub fn with_bytes<R>(&self, allocation: &Allocation, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        if allocation.arena_id != self.inner.id {
            return Err(Status::InvalidArgs);
        }
        let bump = self.inner.bump.read_recursive();
        bump.bytes(&allocation.span).map(f).ok_or(Status::InvalidArgs)
    }

    /// Runs `f` over the mutable bytes of `allocation`.
    pub fn with_bytes_mut<R>(
        &self,
        allocation: &Allocation,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        if allocation.arena_id != self.inner.id {
            return Err(Status::InvalidArgs);
        }
        let mut bump = self.inner.bump.write();
        bump.bytes_mut(&allocation.span).map(f).ok_or(Status::InvalidArgs)
    }

    /// Copies the bytes of `allocation` out of the arena.
    pub fn read(&self, allocation: &Allocation) -> Result<Vec<u8>> {
        self.with_bytes(allocation, <[u8]>::to_vec)
    }

    /// Bytes reserved by all segments.
    pub fn bytes_reserved(&self) -> usize {
        self.inner.bump.read_recursive().reserved()
    }
}
