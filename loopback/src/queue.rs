//! FIFO of received buffers awaiting delivery.

use crate::pool::{Arena, Owner, Slot};

/// Receive queue linked through a device's [Arena].
#[derive(Default)]
pub struct Queue {
    head: Option<Slot>,
    tail: Option<Slot>,
    len: usize,
}

impl Queue {
    /// Append a buffer already handed to the queue.
    pub fn enqueue(&mut self, arena: &mut Arena, slot: Slot) {
        debug_assert_eq!(arena.owner(slot), Owner::Queue);
        arena.set_next(slot, None);
        match self.tail {
            Some(tail) => arena.set_next(tail, Some(slot)),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.len += 1;
    }

    /// Remove the oldest buffer and hand it to `owner`.
    pub fn dequeue(&mut self, arena: &mut Arena, owner: Owner) -> Option<Slot> {
        let slot = self.head?;
        self.head = arena.take_next(slot);
        if self.head.is_none() {
            self.tail = None;
        }
        arena.transfer(slot, Owner::Queue, owner);
        self.len -= 1;
        Some(slot)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;

    fn push(arena: &mut Arena, pool: &mut Pool, queue: &mut Queue, value: u8) {
        let slot = pool.acquire(arena, Owner::Queue).unwrap();
        arena.write(slot, &[value]);
        queue.enqueue(arena, slot);
    }

    #[test]
    fn test_fifo() {
        let mut arena = Arena::new(4);
        let mut pool = Pool::new(&mut arena);
        let mut queue = Queue::default();
        for value in 1..=3 {
            push(&mut arena, &mut pool, &mut queue, value);
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(arena.owners(), [1, 0, 3, 0]);

        for expected in 1..=3 {
            let slot = queue.dequeue(&mut arena, Owner::Delivering).unwrap();
            assert_eq!(arena.frame(slot), &[expected]);
            pool.release(&mut arena, slot, Owner::Delivering);
        }
        assert!(queue.is_empty());
        assert!(queue.dequeue(&mut arena, Owner::Delivering).is_none());
        assert_eq!(pool.free(), 4);
    }

    #[test]
    fn test_interleaved() {
        let mut arena = Arena::new(2);
        let mut pool = Pool::new(&mut arena);
        let mut queue = Queue::default();

        // Drain and refill so the tail is reset and relinked
        push(&mut arena, &mut pool, &mut queue, 1);
        let slot = queue.dequeue(&mut arena, Owner::Delivering).unwrap();
        pool.release(&mut arena, slot, Owner::Delivering);
        push(&mut arena, &mut pool, &mut queue, 2);
        push(&mut arena, &mut pool, &mut queue, 3);
        assert!(pool.is_blocked());

        let slot = queue.dequeue(&mut arena, Owner::Delivering).unwrap();
        assert_eq!(arena.frame(slot), &[2]);
        pool.release(&mut arena, slot, Owner::Delivering);
        push(&mut arena, &mut pool, &mut queue, 4);

        let order: Vec<_> = std::iter::from_fn(|| {
            let slot = queue.dequeue(&mut arena, Owner::Delivering)?;
            let value = arena.frame(slot)[0];
            pool.release(&mut arena, slot, Owner::Delivering);
            Some(value)
        })
        .collect();
        assert_eq!(order, vec![3, 4]);
    }
}
