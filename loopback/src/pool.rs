//! Fixed arena of packet buffers and the free list threaded through it.
//!
//! Every buffer a device will ever use is allocated when the arena is created. Buffers are
//! addressed by [Slot] and linked by index, so the free list and the receive queue share the same
//! storage without owning pointers into it.

use crate::frame::MAX_FRAME_LEN;

/// Index of a buffer within a device's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Slot(usize);

/// Collection that currently holds a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Owner {
    /// On the device's free list.
    Pool,
    /// Reserved for a transmission awaiting completion.
    InFlight,
    /// Waiting on the device's receive queue.
    Queue,
    /// Removed from the receive queue and handed to the upper layer.
    Delivering,
}

struct Buffer {
    data: Box<[u8]>,
    len: usize,
    next: Option<Slot>,
    owner: Owner,
}

/// Storage for a device's buffers.
pub struct Arena {
    buffers: Vec<Buffer>,
}

impl Arena {
    /// Allocate `size` buffers, all owned by the pool.
    pub fn new(size: usize) -> Self {
        let buffers = (0..size)
            .map(|_| Buffer {
                data: vec![0; MAX_FRAME_LEN].into_boxed_slice(),
                len: 0,
                next: None,
                owner: Owner::Pool,
            })
            .collect();
        Self { buffers }
    }

    /// Number of buffers in the arena.
    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }

    /// Copy `frame` into a buffer.
    pub fn write(&mut self, slot: Slot, frame: &[u8]) {
        debug_assert!(frame.len() <= MAX_FRAME_LEN);
        let buffer = &mut self.buffers[slot.0];
        buffer.data[..frame.len()].copy_from_slice(frame);
        buffer.len = frame.len();
    }

    /// Contents of a buffer.
    pub fn frame(&self, slot: Slot) -> &[u8] {
        let buffer = &self.buffers[slot.0];
        &buffer.data[..buffer.len]
    }

    /// Mutable contents of a buffer.
    pub fn frame_mut(&mut self, slot: Slot) -> &mut [u8] {
        let buffer = &mut self.buffers[slot.0];
        &mut buffer.data[..buffer.len]
    }

    /// Collection that holds a buffer.
    pub fn owner(&self, slot: Slot) -> Owner {
        self.buffers[slot.0].owner
    }

    /// Count buffers by owner, in the order pool, in-flight, queue, delivering.
    pub fn owners(&self) -> [usize; 4] {
        let mut counts = [0; 4];
        for buffer in &self.buffers {
            let index = match buffer.owner {
                Owner::Pool => 0,
                Owner::InFlight => 1,
                Owner::Queue => 2,
                Owner::Delivering => 3,
            };
            counts[index] += 1;
        }
        counts
    }

    /// Move a buffer between collections.
    pub(crate) fn transfer(&mut self, slot: Slot, from: Owner, to: Owner) {
        let buffer = &mut self.buffers[slot.0];
        debug_assert_eq!(buffer.owner, from, "{slot:?} is not owned by {from:?}");
        buffer.owner = to;
    }

    pub(crate) fn next(&self, slot: Slot) -> Option<Slot> {
        self.buffers[slot.0].next
    }

    pub(crate) fn take_next(&mut self, slot: Slot) -> Option<Slot> {
        self.buffers[slot.0].next.take()
    }

    pub(crate) fn set_next(&mut self, slot: Slot, next: Option<Slot>) {
        self.buffers[slot.0].next = next;
    }
}

/// Free list of a device's buffers.
///
/// The pool is blocked exactly when it is empty. The release that takes it from empty to one free
/// buffer reports the unblock; no other release does.
pub struct Pool {
    head: Option<Slot>,
    free: usize,
    blocked: bool,
}

impl Pool {
    /// Thread every buffer in `arena` onto a new free list.
    pub fn new(arena: &mut Arena) -> Self {
        let mut head = None;
        for index in (0..arena.capacity()).rev() {
            let slot = Slot(index);
            arena.set_next(slot, head);
            head = Some(slot);
        }
        Self {
            head,
            free: arena.capacity(),
            blocked: arena.capacity() == 0,
        }
    }

    /// Pop a buffer and hand it to `owner`.
    ///
    /// Returns `None` when the pool is empty.
    pub fn acquire(&mut self, arena: &mut Arena, owner: Owner) -> Option<Slot> {
        let slot = self.head?;
        self.head = arena.take_next(slot);
        arena.transfer(slot, Owner::Pool, owner);
        self.free -= 1;
        if self.free == 0 {
            self.blocked = true;
        }
        Some(slot)
    }

    /// Return a buffer held by `owner`.
    ///
    /// Returns true if this release unblocked the pool.
    pub fn release(&mut self, arena: &mut Arena, slot: Slot, owner: Owner) -> bool {
        arena.transfer(slot, owner, Owner::Pool);
        arena.set_next(slot, self.head);
        self.head = Some(slot);
        self.free += 1;
        if self.blocked && self.free == 1 {
            self.blocked = false;
            return true;
        }
        false
    }

    /// Number of buffers on the free list.
    pub fn free(&self) -> usize {
        self.free
    }

    /// Whether the free list is exhausted.
    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// Iterate over the free list.
    pub fn iter<'a>(&self, arena: &'a Arena) -> impl Iterator<Item = Slot> + 'a {
        std::iter::successors(self.head, move |slot| arena.next(*slot))
    }
}
