// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]

//! CONTEXT: Segmented bump allocator backing message arenas
//! OWNERS: @runtime
//! PUBLIC API: SegmentedBump, Span, AllocError
//! DEPENDS_ON: alloc
//! INVARIANTS: Segments never move or shrink once reserved; spans stay valid until the
//!             allocator is dropped; reservation is fallible (no abort on OOM)
//! ADR: docs/adr/0003-driver-runtime-architecture.md

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

extern crate alloc;

use alloc::{boxed::Box, vec::Vec};
use core::fmt;

/// Default size of a freshly reserved segment.
pub const DEFAULT_SEGMENT_SIZE: usize = 4096;

/// Alignment applied to every allocation.
pub const DEFAULT_ALIGN: usize = 8;

/// Location of one allocation inside a [`SegmentedBump`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Span {
    segment: usize,
    offset: usize,
    len: usize,
}

impl Span {
    /// Index of the segment holding the bytes.
    pub const fn segment(&self) -> usize {
        self.segment
    }

    /// Byte offset inside the segment.
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Number of bytes covered.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true for zero-length spans.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Errors reported by [`SegmentedBump::alloc`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// Requested alignment is zero or not a power of two.
    BadAlign,
    /// Size arithmetic overflowed.
    Overflow,
    /// The backing segment could not be reserved.
    OutOfMemory,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadAlign => write!(f, "alignment must be a power of two"),
            Self::Overflow => write!(f, "allocation size overflow"),
            Self::OutOfMemory => write!(f, "segment reservation failed"),
        }
    }
}

/// One contiguous backing buffer and its bump cursor.
struct Segment {
    buf: Box<[u8]>,
    cursor: usize,
}

impl Segment {
    fn reserve(size: usize) -> Result<Self, AllocError> {
        let mut storage = Vec::new();
        storage.try_reserve_exact(size).map_err(|_| AllocError::OutOfMemory)?;
        storage.resize(size, 0);
        Ok(Self { buf: storage.into_boxed_slice(), cursor: 0 })
    }

    fn base(&self) -> usize {
        self.buf.as_ptr() as usize
    }

    /// Bumps the cursor; offsets are aligned against the real address of the buffer.
    fn bump(&mut self, len: usize, align: usize) -> Option<usize> {
        let base = self.base();
        let align_mask = align - 1;
        let addr = base.checked_add(self.cursor)?;
        let aligned = addr.checked_add(align_mask)? & !align_mask;
        let offset = aligned - base;
        let next = offset.checked_add(len)?;
        if next > self.buf.len() {
            return None;
        }
        self.cursor = next;
        Some(offset)
    }
}

/// Append-only allocator made of independently reserved segments.
///
/// Allocation never moves existing bytes, so the address of a span is stable for the lifetime
/// of the allocator. Nothing is reclaimed before drop.
pub struct SegmentedBump {
    segments: Vec<Segment>,
    segment_size: usize,
}

impl Default for SegmentedBump {
    fn default() -> Self {
        Self::new(DEFAULT_SEGMENT_SIZE)
    }
}

impl SegmentedBump {
    /// Creates an empty allocator; no memory is reserved until the first allocation.
    pub const fn new(segment_size: usize) -> Self {
        Self { segments: Vec::new(), segment_size }
    }

    /// Carves `len` bytes aligned to `align`, reserving a new segment when the current one is full.
    pub fn alloc(&mut self, len: usize, align: usize) -> Result<Span, AllocError> {
        if align == 0 || !align.is_power_of_two() {
            return Err(AllocError::BadAlign);
        }
        if let Some(last) = self.segments.last_mut() {
            if let Some(offset) = last.bump(len, align) {
                return Ok(Span { segment: self.segments.len() - 1, offset, len });
            }
        }
        let wanted = len.checked_add(align - 1).ok_or(AllocError::Overflow)?;
        let mut segment = Segment::reserve(wanted.max(self.segment_size))?;
        let offset = segment.bump(len, align).ok_or(AllocError::Overflow)?;
        self.segments.push(segment);
        Ok(Span { segment: self.segments.len() - 1, offset, len })
    }

    /// Bytes of a span, or `None` when the span did not come from this allocator.
    pub fn bytes(&self, span: &Span) -> Option<&[u8]> {
        if !self.owns(span) {
            return None;
        }
        self.segments[span.segment].buf.get(span.offset..span.offset + span.len)
    }

    /// Mutable bytes of a span, or `None` when the span did not come from this allocator.
    pub fn bytes_mut(&mut self, span: &Span) -> Option<&mut [u8]> {
        if !self.owns(span) {
            return None;
        }
        self.segments[span.segment].buf.get_mut(span.offset..span.offset + span.len)
    }

    /// Returns true if `span` lies inside the allocated part of one of our segments.
    pub fn owns(&self, span: &Span) -> bool {
        match self.segments.get(span.segment) {
            Some(seg) => span.offset.checked_add(span.len).is_some_and(|end| end <= seg.cursor),
            None => false,
        }
    }

    /// Returns true if the address range `[addr, addr + len)` was handed out by this allocator.
    pub fn contains_addr(&self, addr: usize, len: usize) -> bool {
        let Some(end) = addr.checked_add(len) else {
            return false;
        };
        self.segments.iter().any(|seg| {
            let base = seg.base();
            addr >= base && end <= base + seg.cursor
        })
    }

    /// Address of the first byte of `span`, used to answer address-based containment queries.
    pub fn addr_of(&self, span: &Span) -> Option<usize> {
        self.segments.get(span.segment).map(|seg| seg.base() + span.offset)
    }

    /// Total bytes reserved across all segments.
    pub fn reserved(&self) -> usize {
        self.segments.iter().map(|seg| seg.buf.len()).sum()
    }

    /// Number of reserved segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}
