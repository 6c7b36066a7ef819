//! One-shot timer service shared by every transfer on a bus: protocol
//! timeouts, pre-start interval delays, and the DMA synchronization delay.
//!
//! A dedicated thread owns a deadline heap and is fed through a channel.
//! Timer identity is (transfer, generation); re-arming bumps the transfer's
//! generation, so at most one timer is ever live per transfer and stale
//! firings fall through the generation check on the other side.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Weak;
use std::thread;
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::debug;

use crate::{UsbBus, XferId};

#[derive(Clone, Copy, Debug)]
pub(crate) enum CalloutKind {
    Timeout,
    Interval,
    DmaDelay,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct CalloutMsg {
    pub at: Instant,
    pub xfer: XferId,
    pub gen: u64,
    pub kind: CalloutKind,
}

struct Entry {
    at: Instant,
    seq: u64,
    msg: CalloutMsg,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
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
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

pub(crate) fn spawn(bus: Weak<UsbBus>) -> Sender<CalloutMsg> {
    let (tx, rx) = unbounded();
    thread::spawn(move || run(bus, rx));
    tx
}

fn run(bus: Weak<UsbBus>, rx: Receiver<CalloutMsg>) {
    debug!("callout service running");
    let mut heap: BinaryHeap<Reverse<Entry>> = BinaryHeap::new();
    let mut seq = 0u64;
    loop {
        let now = Instant::now();
        while heap.peek().map_or(false, |Reverse(e)| e.at <= now) {
            let Reverse(e) = heap.pop().unwrap();
            let Some(bus) = bus.upgrade() else {
                debug!("callout service exiting: bus gone");
                return;
            };
            bus.callout_fired(e.msg);
        }
        let msg = match heap.peek() {
            Some(Reverse(e)) => match rx.recv_timeout(e.at.saturating_duration_since(now)) {
                Ok(m) => Some(m),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => return,
            },
            None => match rx.recv() {
                Ok(m) => Some(m),
                Err(_) => {
                    debug!("callout service exiting");
                    return;
                }
            },
        };
        if let Some(m) = msg {
            seq += 1;
            heap.push(Reverse(Entry {
                at: m.at,
                seq,
                msg: m,
            }));
        }
    }
}

/// Fired entries land back on the bus under its lock.
impl UsbBus {
    pub(crate) fn callout_fired(&self, msg: CalloutMsg) {
        let mut st = self.lock_state();
        match msg.kind {
            CalloutKind::Timeout => crate::xfer::timeout_fired(&mut st, msg.xfer, msg.gen),
            CalloutKind::Interval => crate::xfer::interval_fired(&mut st, msg.xfer, msg.gen),
            CalloutKind::DmaDelay => crate::xfer::dma_delay_fired(&mut st, msg.xfer, msg.gen),
        }
    }
}
