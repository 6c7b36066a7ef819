//! The wait queue every transfer moves through: a FIFO of descriptor ids
//! plus the bookkeeping that keeps its drive loop from recursing into
//! itself.
//!
//! Three owners use this structure: each pipe (transfers waiting for the
//! endpoint), each root's DMA-load stage, and each root's done queue. The
//! owner supplies the per-item step logic; driving one item may complete it
//! synchronously and thereby queue or re-queue others, which is exactly the
//! recursion the `driving`/`redrive` pair flattens into a loop.

use std::collections::VecDeque;

use crate::XferId;

#[derive(Debug, Default)]
pub(crate) struct TransferQueue {
    /// The item being driven, popped off `head` by the drive loop.
    current: Option<XferId>,
    head: VecDeque<XferId>,
    /// Set while a drive loop is running somewhere up the call stack.
    driving: bool,
    /// Set by a re-entrant drive attempt; the active loop notices and goes
    /// around again instead of the caller recursing.
    redrive: bool,
}

impl TransferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert at the tail iff not already waiting. Returns whether the item
    /// was inserted. The `current` item is not "waiting": an item being
    /// driven may legitimately queue itself up again.
    pub fn enqueue(&mut self, xfer: XferId) -> bool {
        if self.is_waiting(xfer) {
            return false;
        }
        self.head.push_back(xfer);
        true
    }

    /// Remove from the waiting list, wherever it is. Safe to call on an
    /// item that is not queued. The `current` item belongs to the owner's
    /// step logic and is not touched here.
    pub fn dequeue(&mut self, xfer: XferId) -> bool {
        if let Some(pos) = self.head.iter().position(|&x| x == xfer) {
            self.head.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn is_waiting(&self, xfer: XferId) -> bool {
        self.head.iter().any(|&x| x == xfer)
    }

    pub fn pop_head(&mut self) -> Option<XferId> {
        self.head.pop_front()
    }

    pub fn current(&self) -> Option<XferId> {
        self.current
    }

    pub fn set_current(&mut self, xfer: Option<XferId>) {
        self.current = xfer;
    }

    /// Prepare a drive pass: install `item` as current (or pop the head when
    /// there is no current item). Returns `true` when the caller owns the
    /// loop and must run steps until [`step_done`](Self::step_done) says to
    /// stop; `false` when an active loop was signalled to go around again,
    /// or there is nothing to drive.
    pub fn begin_drive(&mut self, item: Option<XferId>) -> bool {
        if let Some(x) = item {
            self.current = Some(x);
        } else if self.current.is_none() {
            self.current = self.pop_head();
        }
        if self.current.is_none() {
            return false;
        }
        if self.driving {
            self.redrive = true;
            return false;
        }
        self.driving = true;
        true
    }

    /// Fetch the item for the next step of an owned loop, refilling
    /// `current` from the head when the previous step finished its item.
    /// Clears the redrive request; returns `None` when the loop is done.
    pub fn next_step(&mut self) -> Option<XferId> {
        self.redrive = false;
        if self.current.is_none() {
            self.current = self.pop_head();
        }
        self.current
    }

    /// Decide whether an owned loop should continue after a step: either a
    /// re-entrant drive was requested, or the step finished its item and
    /// more are waiting.
    pub fn step_done(&mut self) -> bool {
        if self.redrive {
            return true;
        }
        self.current.is_none() && !self.head.is_empty()
    }

    /// Release loop ownership taken by [`begin_drive`](Self::begin_drive).
    /// Returns whether work is still present: a drive loop that releases
    /// the surrounding lock between steps must re-enter when items slipped
    /// in behind its last step check, or they would sit unprocessed.
    pub fn end_drive(&mut self) -> bool {
        self.driving = false;
        self.redrive = false;
        self.current.is_some() || !self.head.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> XferId {
        XferId(n)
    }

    #[test]
    fn fifo_order() {
        let mut q = TransferQueue::new();
        for n in 0..8 {
            assert!(q.enqueue(id(n)));
        }
        for n in 0..8 {
            assert_eq!(q.pop_head(), Some(id(n)));
        }
        assert_eq!(q.pop_head(), None);
    }

    #[test]
    fn enqueue_is_idempotent() {
        let mut q = TransferQueue::new();
        assert!(q.enqueue(id(1)));
        assert!(!q.enqueue(id(1)));
        assert_eq!(q.pop_head(), Some(id(1)));
        assert_eq!(q.pop_head(), None);
    }

    #[test]
    fn dequeue_anywhere() {
        let mut q = TransferQueue::new();
        q.enqueue(id(1));
        q.enqueue(id(2));
        q.enqueue(id(3));
        assert!(q.dequeue(id(2)));
        assert!(!q.dequeue(id(2)));
        assert_eq!(q.pop_head(), Some(id(1)));
        assert_eq!(q.pop_head(), Some(id(3)));
    }

    #[test]
    fn reentrant_drive_marks_redrive() {
        let mut q = TransferQueue::new();
        q.enqueue(id(1));
        q.enqueue(id(2));

        assert!(q.begin_drive(None));
        assert_eq!(q.next_step(), Some(id(1)));

        // A nested drive attempt while the loop is active only flags it.
        assert!(!q.begin_drive(None));
        assert!(q.step_done());

        // The step finished its item; the loop advances to the next one.
        q.set_current(None);
        assert_eq!(q.next_step(), Some(id(2)));
        q.set_current(None);
        assert!(!q.step_done());
        q.end_drive();
    }

    #[test]
    fn drive_with_explicit_item() {
        let mut q = TransferQueue::new();
        q.enqueue(id(7));
        assert!(q.begin_drive(Some(id(3))));
        assert_eq!(q.current(), Some(id(3)));
        q.end_drive();
    }
}
