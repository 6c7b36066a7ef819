//! The shared root of a batch of co-configured transfers: the DMA
//! carve-out they share, the done queue, the worker thread that plays the
//! deferred execution context, and the drain condition.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver};
use log::debug;

use common::dma::DmaTag;

use crate::dispatch::{self, XferCtx};
use crate::error::{Result, UsbError};
use crate::hw::HwXfer;
use crate::queue::TransferQueue;
use crate::usb::{DirSpec, EndpointAddr, EndpointTy};
use crate::xfer::{self, IntFlags, QueueRef, TransferInner, XferFlags};
use crate::{tunables, PipeId, RootId, UsbBus, XferId};

/// Driver completion callback, invoked with the private lock held. The
/// first invocation of a cycle observes `Setup`; later ones observe
/// `Transferred` or `Error`.
pub type Callback<D> = fn(&mut D, &mut XferCtx<'_>);

/// One transfer's configuration, matched against the pipe list at setup
/// the way class drivers declare their transfer tables.
pub struct TransferConfig<D> {
    pub ty: EndpointTy,
    pub endpoint: EndpointAddr,
    pub direction: DirSpec,
    /// Carve-out capacity for this transfer's frames.
    pub bufsize: usize,
    /// Maximum frame count; zero selects the type's default.
    pub frames: usize,
    pub flags: XferFlags,
    /// Zero disables the timeout, except on control pipes which fall back
    /// to the configured default.
    pub timeout_ms: u32,
    /// Optional pre-start delay for bulk and control transfers.
    pub interval_ms: u32,
    pub callback: Callback<D>,
}

/// Bus-side, driver-type-erased part of a root: the queues and the token
/// channel completions use to wake the worker.
pub(crate) struct RootCtl {
    pub dma_q: TransferQueue,
    pub done_q: TransferQueue,
    pub token_tx: crossbeam_channel::Sender<()>,
    pub members: Vec<XferId>,
}

/// Worker-side state, shared between the public handle, the worker thread,
/// and dispatch.
pub(crate) struct RootShared<D: Send + 'static> {
    pub bus: Arc<UsbBus>,
    pub root_id: RootId,
    /// The driver's private lock. Held across callbacks; the drain
    /// condition variable pairs with it.
    pub driver: Mutex<D>,
    pub drain_cv: Condvar,
    pub callbacks: Vec<Callback<D>>,
    pub members: Vec<XferId>,
}

/// A batch of transfer descriptors set up together, plus their deferred
/// execution context. Dropping the root tears everything down, draining
/// first.
pub struct TransferRoot<D: Send + 'static> {
    shared: Arc<RootShared<D>>,
    worker: Option<JoinHandle<()>>,
    torn_down: bool,
}

/// Proof that the driver's private lock is held. All transfer operations
/// that may run callbacks synchronously live here; `Deref` gives access to
/// the driver state itself.
pub struct DriverGuard<'a, D: Send + 'static> {
    shared: &'a Arc<RootShared<D>>,
    drv: Option<MutexGuard<'a, D>>,
}

struct PlannedXfer {
    pipe: PipeId,
    nframes: usize,
    bufsize: usize,
    timeout_ms: u32,
    offset: usize,
    uses_dma: bool,
}

const CARVE_ALIGN: usize = 64;

fn align_up(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}

/// Batch-allocate transfer descriptors against a pipe list. All carve-out
/// backed frames of the batch share a single DMA allocation; descriptors
/// are reused across start/stop cycles without reallocation until
/// [`TransferRoot::unsetup`].
pub fn transfer_setup<D: Send + 'static>(
    bus: &Arc<UsbBus>,
    pipes: &[PipeId],
    configs: &[TransferConfig<D>],
    driver: D,
) -> Result<(TransferRoot<D>, Vec<XferId>)> {
    if configs.is_empty() {
        return Err(UsbError::InvalidParameter);
    }

    let limits = &tunables().limits;
    let mut planned = Vec::with_capacity(configs.len());
    let mut total = 0usize;
    {
        let st = bus.lock_state();
        for cfg in configs {
            let pid = pipes
                .iter()
                .copied()
                .find(|&p| match st.get_pipe(p) {
                    Some(pipe) => {
                        pipe.desc.ty == cfg.ty
                            && cfg.endpoint.matches(pipe.desc.number)
                            && cfg.direction.matches(pipe.desc.direction)
                    }
                    None => false,
                })
                .ok_or(UsbError::InvalidParameter)?;

            if cfg.bufsize > limits.max_bufsize || cfg.frames > limits.max_frames {
                return Err(UsbError::InvalidParameter);
            }
            let nframes = if cfg.frames != 0 {
                cfg.frames
            } else if cfg.ty == EndpointTy::Ctrl {
                crate::control::default_control_frames(cfg.bufsize)
            } else {
                1
            };
            if cfg.ty == EndpointTy::Ctrl && cfg.bufsize < crate::usb::SETUP_LEN {
                // No room for the SETUP header.
                return Err(UsbError::InvalidParameter);
            }
            let timeout_ms = if cfg.timeout_ms == 0 && cfg.ty == EndpointTy::Ctrl {
                tunables().timing.default_control_timeout_ms
            } else {
                cfg.timeout_ms
            };

            let offset = align_up(total, CARVE_ALIGN);
            total = offset + cfg.bufsize;
            planned.push(PlannedXfer {
                pipe: pid,
                nframes,
                bufsize: cfg.bufsize,
                timeout_ms,
                offset,
                uses_dma: st.pipe(pid).methods.uses_dma_load(),
            });
        }
    }

    let carve = if total > 0 {
        let tag = DmaTag::page_aligned();
        Some(Arc::new(
            tag.allocate(total).map_err(|_| UsbError::ResourceExhausted)?,
        ))
    } else {
        None
    };

    let (token_tx, token_rx) = bounded(2);
    let mut members = Vec::with_capacity(configs.len());
    {
        let mut st = bus.lock_state();
        let root_id = st.alloc_root_id();
        for (local_idx, (cfg, plan)) in configs.iter().zip(&planned).enumerate() {
            let id = st.alloc_xfer_id();
            let desc = st.pipe(plan.pipe).desc;
            let local_buf = match (&carve, plan.bufsize) {
                (Some(buf), n) if n > 0 => {
                    // Disjoint by construction: each transfer gets its own
                    // aligned range of the batch allocation.
                    Some(unsafe { common::dma::DmaSlice::carve(buf, plan.offset, n) })
                }
                _ => None,
            };
            let inner = TransferInner::new(
                root_id,
                plan.pipe,
                local_idx,
                desc.number,
                desc.direction,
                desc.ty,
                desc.max_packet_size,
                plan.bufsize,
                plan.nframes,
                cfg.flags,
                plan.timeout_ms,
                cfg.interval_ms,
                plan.uses_dma,
                local_buf,
            );
            st.insert_xfer(id, inner);
            st.pipe_mut(plan.pipe).refcount += 1;
            members.push(id);
        }
        st.insert_root(
            root_id,
            RootCtl {
                dma_q: TransferQueue::new(),
                done_q: TransferQueue::new(),
                token_tx,
                members: members.clone(),
            },
        );

        let shared = Arc::new(RootShared {
            bus: Arc::clone(bus),
            root_id,
            driver: Mutex::new(driver),
            drain_cv: Condvar::new(),
            callbacks: configs.iter().map(|c| c.callback).collect(),
            members: members.clone(),
        });
        drop(st);

        let worker_shared = Arc::clone(&shared);
        let worker = thread::spawn(move || worker_loop(worker_shared, token_rx));

        debug!(
            "set up transfer root {:?} with {} transfers",
            root_id,
            members.len()
        );
        Ok((
            TransferRoot {
                shared,
                worker: Some(worker),
                torn_down: false,
            },
            members,
        ))
    }
}

/// The root's deferred execution context: woken by completion tokens,
/// takes the private lock and then drains the done queue.
fn worker_loop<D: Send + 'static>(shared: Arc<RootShared<D>>, rx: Receiver<()>) {
    debug!("transfer callback worker running");
    while rx.recv().is_ok() {
        let mut drv = shared.driver.lock().unwrap();
        dispatch::drive_done_queue(&shared, &mut drv);
    }
    debug!("transfer callback worker exiting");
}

impl<D: Send + 'static> TransferRoot<D> {
    /// Take the driver's private lock.
    pub fn lock(&self) -> DriverGuard<'_, D> {
        DriverGuard {
            shared: &self.shared,
            drv: Some(self.shared.driver.lock().unwrap()),
        }
    }

    pub fn members(&self) -> &[XferId] {
        &self.shared.members
    }

    pub fn bus(&self) -> &Arc<UsbBus> {
        &self.shared.bus
    }

    /// Tear the batch down: stop and drain every member, release hardware
    /// resources and the carve-out. Blocks until no DMA or hardware
    /// operation can still touch the buffers.
    pub fn unsetup(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        let members = self.shared.members.clone();
        {
            let mut guard = self.lock();
            for &id in &members {
                guard.stop(id);
            }
            for &id in &members {
                guard.drain(id);
            }
        }
        {
            let mut st = self.shared.bus.lock_state();
            for &id in &members {
                let (open, pid) = match st.get_xfer(id) {
                    Some(x) => (x.int_flags.contains(IntFlags::OPEN), x.pipe),
                    None => continue,
                };
                if open {
                    let ops = st.pipe(pid).methods.clone();
                    ops.close(&mut HwXfer { st: &mut *st, id });
                }
                // A frozen pipe may still hold the transfer as current.
                if st.pipe(pid).queue.current() == Some(id) {
                    st.pipe_mut(pid).queue.set_current(None);
                }
                st.pipe_mut(pid).queue.dequeue(id);
                st.remove_xfer(id);
                st.pipe_mut(pid).refcount -= 1;
                xfer::command_wrapper(&mut st, QueueRef::Pipe(pid), None);
            }
            // Dropping the control block drops the last token sender; the
            // worker sees the disconnect and exits.
            st.remove_root(self.shared.root_id);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        debug!("tore down transfer root {:?}", self.shared.root_id);
    }
}

impl<D: Send + 'static> Drop for TransferRoot<D> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<D: Send + 'static> DriverGuard<'_, D> {
    fn drv_mut(&mut self) -> &mut D {
        self.drv.as_mut().expect("driver guard poisoned").deref_mut()
    }

    /// Start a transfer. Never blocks. Idempotent while a cycle is in
    /// flight; otherwise the driver callback runs (synchronously, on this
    /// thread) to supply buffers and submit.
    pub fn start(&mut self, xfer: XferId) {
        {
            let mut st = self.shared.bus.lock_state();
            xfer::start_locked(&mut st, xfer);
        }
        let shared = self.shared;
        dispatch::drive_done_queue(shared, self.drv.as_mut().unwrap());
    }

    /// Cancel a transfer. Never blocks; the `Cancelled` completion runs
    /// synchronously when the hardware phase allows, otherwise when the
    /// hardware reports on its own.
    pub fn stop(&mut self, xfer: XferId) {
        {
            let mut st = self.shared.bus.lock_state();
            xfer::stop_locked(&mut st, xfer);
        }
        let shared = self.shared;
        dispatch::drive_done_queue(shared, self.drv.as_mut().unwrap());
    }

    /// Whether any queue, timer, or hardware still references the
    /// transfer.
    pub fn pending(&self, xfer: XferId) -> bool {
        let st = self.shared.bus.lock_state();
        xfer::pending_locked(&st, xfer)
    }

    /// Stop the transfer and block until nothing references it anymore.
    /// On return the transfer's buffers may be reused or freed. Must not
    /// be called from a transfer callback.
    pub fn drain(&mut self, xfer: XferId) {
        self.stop(xfer);
        loop {
            {
                let st = self.shared.bus.lock_state();
                if !xfer::pending_locked(&st, xfer) {
                    return;
                }
            }
            let guard = self.drv.take().expect("driver guard poisoned");
            let guard = self
                .shared
                .drain_cv
                .wait(guard)
                .unwrap_or_else(|e| e.into_inner());
            self.drv = Some(guard);
        }
    }
}

impl<D: Send + 'static> Deref for DriverGuard<'_, D> {
    type Target = D;
    fn deref(&self) -> &D {
        self.drv.as_ref().expect("driver guard poisoned").deref()
    }
}

impl<D: Send + 'static> DerefMut for DriverGuard<'_, D> {
    fn deref_mut(&mut self) -> &mut D {
        self.drv_mut()
    }
}
