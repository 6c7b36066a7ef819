//! Per-endpoint scheduling: the pipe queue's step function, stall state,
//! and the pre-start interval delay.

use std::sync::Arc;

use log::{debug, trace};

use crate::hw::{HwXfer, PipeMethods};
use crate::queue::TransferQueue;
use crate::usb::{EndpointDesc, EndpointTy};
use crate::xfer::{self, IntFlags, Phase};
use crate::{BusState, PipeId};

pub(crate) struct PipeInner {
    pub desc: EndpointDesc,
    /// Capability table of the controller family driving this endpoint.
    /// Shared, not owned: many pipes of one controller use the same table.
    pub methods: Arc<dyn PipeMethods>,
    pub queue: TransferQueue,
    pub stalled: bool,
    /// Transfers configured against this pipe; endpoint reconfiguration is
    /// refused while nonzero.
    pub refcount: usize,
}

impl PipeInner {
    pub fn new(desc: EndpointDesc, methods: Arc<dyn PipeMethods>) -> Self {
        Self {
            desc,
            methods,
            queue: TransferQueue::new(),
            stalled: false,
            refcount: 0,
        }
    }
}

/// Step function of a pipe queue: take the current transfer as far toward
/// the hardware as its state allows. Leaving the transfer current without
/// completing it parks the pipe (stall, interval delay, hardware mid-
/// flight) until some event drives the queue again.
pub(crate) fn pipe_step(st: &mut BusState, pid: PipeId) {
    let Some(id) = st.pipe(pid).queue.current() else { return };
    if st.pipe(pid).stalled {
        trace!("pipe {:?}: stalled, no progress", pid);
        return;
    }
    if !st.contains_xfer(id) {
        st.pipe_mut(pid).queue.set_current(None);
        return;
    }
    if st.xfer(id).phase != Phase::Queued {
        // Mid-hardware or awaiting callback dispatch; the completion path
        // advances the queue.
        return;
    }

    if st.xfer(id).int_flags.contains(IntFlags::STALL_REQ) {
        st.xfer_mut(id).int_flags.remove(IntFlags::STALL_REQ);
        if st.xfer(id).ep_ty.supports_stall() {
            debug!("pipe {:?}: stall requested by transfer {:?}", pid, id);
            st.pipe_mut(pid).stalled = true;
            let ops = st.pipe(pid).methods.clone();
            ops.set_stall(pid);
            return;
        }
    }

    if st.xfer(id).view().frames.is_empty() {
        // Nothing to move; completes immediately. Used by transfers whose
        // whole point is the stall handling above.
        xfer::complete_locked(st, id, None);
        return;
    }

    {
        let x = st.xfer(id);
        if x.interval_ms > 0
            && !x.int_flags.contains(IntFlags::INTERVAL_DONE)
            && matches!(x.ep_ty, EndpointTy::Bulk | EndpointTy::Ctrl)
        {
            let ms = x.interval_ms;
            trace!("pipe {:?}: delaying transfer {:?} by {} ms", pid, id, ms);
            st.arm_interval(id, ms);
            return;
        }
    }

    st.xfer_mut(id).phase = Phase::Transferring;
    let ops = st.pipe(pid).methods.clone();

    ops.enter(&mut HwXfer { st: &mut *st, id });
    if st.xfer(id).phase != Phase::Transferring {
        // Completed (or failed) synchronously during enter.
        return;
    }
    st.xfer_mut(id).can_cancel = ops.enter_is_cancelable();

    let timeout_ms = st.xfer(id).view().timeout_ms;
    if timeout_ms > 0 {
        st.arm_timeout(id, timeout_ms);
    }

    ops.start(&mut HwXfer { st: &mut *st, id });
    if st.xfer(id).phase != Phase::Transferring {
        return;
    }
    st.xfer_mut(id).can_cancel = ops.start_is_cancelable();
}
