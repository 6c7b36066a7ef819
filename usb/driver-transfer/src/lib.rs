//! Generic USB transfer management.
//!
//! This crate is the layer between USB class drivers and host-controller
//! hardware drivers: it takes a driver's description of a transfer
//! (buffers, frame lengths, endpoint, direction), drives it through the
//! controller's open/enter/start/close operations, manages DMA buffer
//! loading, and dispatches completion callbacks without ever acquiring the
//! driver's private lock from interrupt context.
//!
//! The pieces, bottom up:
//!
//! * [`UsbBus`] — one controller's shared state ("bus lock" domain):
//!   pipes, the transfer arena, per-endpoint-type counters.
//! * [`PipeMethods`] — the capability table a controller family implements
//!   per endpoint.
//! * [`transfer_setup`] — batch-allocates transfer descriptors for one
//!   driver instance, sharing a single DMA carve-out and a deferred
//!   callback worker ([`TransferRoot`]).
//! * [`DriverGuard`] — the driver's private lock; `start`/`stop`/`drain`
//!   live on it, and completion callbacks always run under it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use log::{debug, warn};
use serde::Deserialize;

mod callout;
mod control;
mod dispatch;
mod error;
mod hw;
mod pipe;
mod queue;
mod root;
mod usb;
mod xfer;

pub use crate::dispatch::{XferCtx, XferState};
pub use crate::error::{Result, UsbError};
pub use crate::hw::{HwXfer, PipeMethods};
pub use crate::root::{
    transfer_setup, Callback, DriverGuard, TransferConfig, TransferRoot,
};
pub use crate::usb::{
    DirSpec, Direction, EndpointAddr, EndpointDesc, EndpointTy, Setup, SETUP_LEN,
};
pub use crate::xfer::XferFlags;

use crate::callout::{CalloutKind, CalloutMsg};
use crate::pipe::PipeInner;
use crate::queue::TransferQueue;
use crate::root::RootCtl;
use crate::xfer::TransferInner;

/// Handle of one transfer descriptor. Stable for the lifetime of its setup
/// batch.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct XferId(pub(crate) u32);

/// Handle of one endpoint direction on a bus.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PipeId(pub(crate) u32);

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct RootId(pub(crate) u32);

#[derive(Deserialize)]
pub(crate) struct Limits {
    pub(crate) max_frames: usize,
    pub(crate) max_bufsize: usize,
}

#[derive(Deserialize)]
pub(crate) struct Timing {
    pub(crate) default_control_timeout_ms: u32,
}

#[derive(Deserialize)]
pub(crate) struct Tunables {
    pub(crate) limits: Limits,
    pub(crate) timing: Timing,
}

lazy_static! {
    static ref TUNABLES: Tunables = {
        const TOML: &'static [u8] = include_bytes!("tunables.toml");
        toml::from_slice::<Tunables>(TOML).expect("Failed to parse internally embedded tunables")
    };
}

pub(crate) fn tunables() -> &'static Tunables {
    &TUNABLES
}

/// Per-bus knobs, loadable from a daemon's configuration file.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct BusConfig {
    /// Milliseconds the bus needs after aborting a transfer before
    /// in-flight DMA is guaranteed to have stopped touching its buffers.
    /// Completion callbacks for cancelled and timed-out transfers are held
    /// back this long.
    #[serde(default)]
    pub dma_delay_ms: u32,
}

/// Per-endpoint-type transfer counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct XferStats {
    pub ok: u64,
    pub err: u64,
}

/// One host controller's shared context. Everything behind the mutex is
/// the "bus lock" domain: held briefly, taken by hardware completion
/// paths, and ordered after any driver's private lock.
pub struct UsbBus {
    state: Mutex<BusState>,
}

pub(crate) struct BusState {
    xfers: BTreeMap<XferId, TransferInner>,
    pipes: BTreeMap<PipeId, PipeInner>,
    roots: BTreeMap<RootId, RootCtl>,
    /// Success/error counters per endpoint type, mutated only under the
    /// bus lock.
    stats: [XferStats; 4],
    dma_delay_ms: u32,
    callout_tx: crossbeam_channel::Sender<CalloutMsg>,
    next_xfer: u32,
    next_pipe: u32,
    next_root: u32,
}

fn ty_index(ty: EndpointTy) -> usize {
    match ty {
        EndpointTy::Ctrl => 0,
        EndpointTy::Isoch => 1,
        EndpointTy::Bulk => 2,
        EndpointTy::Interrupt => 3,
    }
}

impl UsbBus {
    pub fn new(config: BusConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let callout_tx = callout::spawn(weak.clone());
            UsbBus {
                state: Mutex::new(BusState {
                    xfers: BTreeMap::new(),
                    pipes: BTreeMap::new(),
                    roots: BTreeMap::new(),
                    stats: [XferStats::default(); 4],
                    dma_delay_ms: config.dma_delay_ms,
                    callout_tx,
                    next_xfer: 0,
                    next_pipe: 0,
                    next_root: 0,
                }),
            }
        })
    }

    /// Register one endpoint direction with its controller capability
    /// table.
    pub fn attach_pipe(&self, desc: EndpointDesc, methods: Arc<dyn PipeMethods>) -> PipeId {
        let mut st = self.lock_state();
        let id = PipeId(st.next_pipe);
        st.next_pipe += 1;
        st.pipes.insert(id, PipeInner::new(desc, methods));
        debug!(
            "attached pipe {:?}: ep {} {:?} {:?}",
            id, desc.number, desc.ty, desc.direction
        );
        id
    }

    /// Remove a pipe. Refused while transfers are still configured against
    /// it.
    pub fn detach_pipe(&self, pipe: PipeId) -> Result<()> {
        let mut st = self.lock_state();
        match st.pipes.get(&pipe) {
            Some(p) if p.refcount != 0 => {
                warn!(
                    "refusing to detach pipe {:?} with {} transfers configured",
                    pipe, p.refcount
                );
                Err(UsbError::InvalidParameter)
            }
            Some(_) => {
                st.pipes.remove(&pipe);
                Ok(())
            }
            None => Err(UsbError::InvalidParameter),
        }
    }

    /// Clear a pipe's stall condition and resume driving its queue. Called
    /// by class drivers once their ClearFeature(ENDPOINT_HALT) control
    /// transfer has completed.
    pub fn clear_stall(&self, pipe: PipeId) {
        let mut st = self.lock_state();
        let Some(p) = st.pipes.get_mut(&pipe) else { return };
        if p.stalled {
            debug!("pipe {:?}: stall cleared", pipe);
        }
        p.stalled = false;
        xfer::command_wrapper(&mut st, xfer::QueueRef::Pipe(pipe), None);
    }

    pub fn pipe_stalled(&self, pipe: PipeId) -> bool {
        let st = self.lock_state();
        st.pipes.get(&pipe).map_or(false, |p| p.stalled)
    }

    pub fn stats(&self, ty: EndpointTy) -> XferStats {
        let st = self.lock_state();
        st.stats[ty_index(ty)]
    }

    /// Hardware completion entry point: gives interrupt context a view of
    /// one transfer under the bus lock. Returns `None` when the transfer no
    /// longer exists. Completion callbacks triggered from the closure are
    /// deferred to the owning root's worker; this never takes a private
    /// lock.
    pub fn hw_access<R>(&self, xfer: XferId, f: impl FnOnce(&mut HwXfer<'_>) -> R) -> Option<R> {
        let mut st = self.lock_state();
        if !st.contains_xfer(xfer) {
            return None;
        }
        let mut hw = HwXfer {
            st: &mut *st,
            id: xfer,
        };
        Some(f(&mut hw))
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap()
    }
}

impl BusState {
    pub fn xfer(&self, id: XferId) -> &TransferInner {
        self.xfers.get(&id).expect("unknown transfer id")
    }

    pub fn xfer_mut(&mut self, id: XferId) -> &mut TransferInner {
        self.xfers.get_mut(&id).expect("unknown transfer id")
    }

    pub fn get_xfer(&self, id: XferId) -> Option<&TransferInner> {
        self.xfers.get(&id)
    }

    pub fn get_xfer_mut(&mut self, id: XferId) -> Option<&mut TransferInner> {
        self.xfers.get_mut(&id)
    }

    pub fn contains_xfer(&self, id: XferId) -> bool {
        self.xfers.contains_key(&id)
    }

    pub fn insert_xfer(&mut self, id: XferId, inner: TransferInner) {
        self.xfers.insert(id, inner);
    }

    pub fn remove_xfer(&mut self, id: XferId) -> Option<TransferInner> {
        self.xfers.remove(&id)
    }

    pub fn pipe(&self, id: PipeId) -> &PipeInner {
        self.pipes.get(&id).expect("unknown pipe id")
    }

    pub fn pipe_mut(&mut self, id: PipeId) -> &mut PipeInner {
        self.pipes.get_mut(&id).expect("unknown pipe id")
    }

    pub fn get_pipe(&self, id: PipeId) -> Option<&PipeInner> {
        self.pipes.get(&id)
    }

    pub fn root_ctl(&self, id: RootId) -> &RootCtl {
        self.roots.get(&id).expect("unknown root id")
    }

    pub fn root_ctl_mut(&mut self, id: RootId) -> &mut RootCtl {
        self.roots.get_mut(&id).expect("unknown root id")
    }

    pub fn insert_root(&mut self, id: RootId, ctl: RootCtl) {
        self.roots.insert(id, ctl);
    }

    pub fn remove_root(&mut self, id: RootId) {
        self.roots.remove(&id);
    }

    pub fn queue_mut(&mut self, q: xfer::QueueRef) -> &mut TransferQueue {
        match q {
            xfer::QueueRef::Pipe(p) => &mut self.pipe_mut(p).queue,
            xfer::QueueRef::DmaLoad(r) => &mut self.root_ctl_mut(r).dma_q,
            xfer::QueueRef::Done(r) => &mut self.root_ctl_mut(r).done_q,
        }
    }

    pub fn stats_mut(&mut self, ty: EndpointTy) -> &mut XferStats {
        &mut self.stats[ty_index(ty)]
    }

    pub fn dma_delay_ms(&self) -> u32 {
        self.dma_delay_ms
    }

    /// Wake the root's deferred execution context. The bounded channel
    /// models the two pre-allocated wakeup slots: a full channel means a
    /// wakeup is already in flight, and nothing is ever allocated here.
    pub fn send_token(&mut self, root: RootId) {
        if let Some(ctl) = self.roots.get(&root) {
            let _ = ctl.token_tx.try_send(());
        }
    }

    pub fn arm_timeout(&mut self, id: XferId, ms: u32) {
        self.arm(id, CalloutKind::Timeout, ms);
    }

    pub fn arm_interval(&mut self, id: XferId, ms: u32) {
        self.arm(id, CalloutKind::Interval, ms);
    }

    pub fn arm_dma_delay(&mut self, id: XferId, ms: u32) {
        self.arm(id, CalloutKind::DmaDelay, ms);
    }

    /// Arm the transfer's single timer. Bumping the generation first
    /// invalidates whatever was armed before, keeping one live timer per
    /// transfer.
    fn arm(&mut self, id: XferId, kind: CalloutKind, ms: u32) {
        let gen = {
            let x = self.xfer_mut(id);
            x.timer_gen += 1;
            x.timer_gen
        };
        let _ = self.callout_tx.send(CalloutMsg {
            at: Instant::now() + Duration::from_millis(u64::from(ms)),
            xfer: id,
            gen,
            kind,
        });
    }

    pub fn alloc_xfer_id(&mut self) -> XferId {
        let id = XferId(self.next_xfer);
        self.next_xfer += 1;
        id
    }

    pub fn alloc_root_id(&mut self) -> RootId {
        let id = RootId(self.next_root);
        self.next_root += 1;
        id
    }
}
