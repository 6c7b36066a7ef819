//! Callback dispatch: the done queue's drive loop and the context a driver
//! callback works with.
//!
//! Completions originate under the bus lock (hardware reports, callouts,
//! synchronous cancels), but the driver callback must run under the
//! driver's private lock with the bus lock released. Every completion is
//! therefore staged on the owning root's done queue; whoever holds the
//! private lock drains it — either the calling thread that already owns the
//! `DriverGuard`, or the root's worker after a token arrives. Acquisition
//! order is always private first, then bus.

use log::{debug, warn};
use smallvec::SmallVec;

use crate::error::UsbError;
use crate::root::RootShared;
use crate::usb::{Direction, EndpointTy, Setup, SETUP_LEN};
use crate::xfer::{self, Frame, IntFlags, Phase, QueueRef, XferFlags, XferView};
use crate::{BusState, XferId};

/// What a callback invocation reports about its transfer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum XferState {
    /// First invocation of a cycle: supply frame lengths and data, then
    /// call [`XferCtx::submit`].
    Setup,
    /// The cycle completed successfully.
    Transferred,
    /// The cycle ended with the recorded error.
    Error(UsbError),
}

pub(crate) enum PendingOp {
    Submit,
    Start(XferId),
    Stop(XferId),
    RequestStall,
}

pub(crate) struct CtxInfo {
    pub id: XferId,
    pub endpoint: u8,
    pub ep_ty: EndpointTy,
    pub direction: Direction,
    pub max_packet: u16,
    pub bufsize: usize,
    pub nframes_max: usize,
    pub sum_len: usize,
}

/// The driver callback's working view of its transfer. Frame storage is
/// checked out of the arena for the duration of the callback, so everything
/// here operates without any lock besides the private one the caller
/// already holds.
pub struct XferCtx<'a> {
    state: XferState,
    info: CtxInfo,
    view: &'a mut XferView,
    ops: SmallVec<[PendingOp; 4]>,
}

impl XferCtx<'_> {
    pub fn id(&self) -> XferId {
        self.info.id
    }

    pub fn state(&self) -> XferState {
        self.state
    }

    pub fn error(&self) -> Option<UsbError> {
        match self.state {
            XferState::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn endpoint(&self) -> u8 {
        self.info.endpoint
    }

    pub fn ep_type(&self) -> EndpointTy {
        self.info.ep_ty
    }

    pub fn direction(&self) -> Direction {
        self.info.direction
    }

    pub fn max_packet_size(&self) -> u16 {
        self.info.max_packet
    }

    /// Capacity of the carve-out backing this transfer's frames.
    pub fn max_len(&self) -> usize {
        self.info.bufsize
    }

    /// Total requested length of the cycle that just finished.
    pub fn sum_length(&self) -> usize {
        self.info.sum_len
    }

    /// Total bytes the hardware actually moved.
    pub fn actual_length(&self) -> usize {
        self.view.frames.iter().map(|f| f.act_len).sum()
    }

    pub fn num_frames(&self) -> usize {
        self.view.frames.len()
    }

    /// Shrink or grow the frame list, up to the configured maximum.
    pub fn set_frames(&mut self, n: usize) {
        assert!(
            n <= self.info.nframes_max,
            "frame count {} exceeds configured maximum {}",
            n,
            self.info.nframes_max
        );
        self.view.frames.resize(n, Frame::default());
    }

    pub fn frame_len(&self, frame: usize) -> usize {
        self.view.frames[frame].req_len
    }

    pub fn set_frame_len(&mut self, frame: usize, len: usize) {
        self.view.frames[frame].req_len = len;
    }

    pub fn frame_act_len(&self, frame: usize) -> usize {
        self.view.frames[frame].act_len
    }

    pub fn frame(&self, frame: usize) -> &[u8] {
        self.view.frame_bytes(frame)
    }

    pub fn frame_mut(&mut self, frame: usize) -> &mut [u8] {
        self.view.frame_bytes_mut(frame)
    }

    /// Copy driver data into a frame at the given offset.
    pub fn copy_in(&mut self, frame: usize, offset: usize, data: &[u8]) {
        self.view.frame_bytes_mut(frame)[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Copy frame bytes out to driver memory.
    pub fn copy_out(&self, frame: usize, offset: usize, out: &mut [u8]) {
        out.copy_from_slice(&self.view.frame_bytes(frame)[offset..offset + out.len()]);
    }

    /// Hand an externally owned buffer to the transfer. The core never
    /// copies it into the carve-out; the hardware works on it directly.
    pub fn set_frame_data(&mut self, frame: usize, data: Box<[u8]>) {
        let f = &mut self.view.frames[frame];
        f.req_len = data.len();
        f.ext = Some(data);
    }

    /// Reclaim an external buffer after completion.
    pub fn take_frame_data(&mut self, frame: usize) -> Option<Box<[u8]>> {
        let f = &mut self.view.frames[frame];
        f.req_len = 0;
        f.ext.take()
    }

    /// Write the 8-byte SETUP header into frame 0 and size the frame for
    /// it.
    pub fn write_setup(&mut self, setup: &Setup) {
        self.view.frames[0].req_len = SETUP_LEN;
        setup.write_to(self.view.frame_bytes_mut(0));
    }

    /// Deadline for the next cycle; zero disables the timer.
    pub fn set_timeout(&mut self, ms: u32) {
        self.view.timeout_ms = ms;
    }

    /// Ask the pipe to assert a stall before this transfer next reaches
    /// hardware.
    pub fn request_stall(&mut self) {
        self.ops.push(PendingOp::RequestStall);
    }

    /// Submit this transfer with the frame layout configured above.
    /// Takes effect when the callback returns.
    pub fn submit(&mut self) {
        self.ops.push(PendingOp::Submit);
    }

    /// Start another transfer of the same setup batch, the way chained
    /// state machines hop from command to data to status transfers.
    pub fn start(&mut self, xfer: XferId) {
        self.ops.push(PendingOp::Start(xfer));
    }

    pub fn stop(&mut self, xfer: XferId) {
        self.ops.push(PendingOp::Stop(xfer));
    }
}

enum Prepared {
    /// Done queue exhausted.
    Exhausted,
    /// Entry no longer wants its callback (stopped before the first
    /// dispatch ran).
    Discard,
    Run {
        id: XferId,
        local_idx: usize,
        state: XferState,
        view: XferView,
        info: CtxInfo,
    },
}

/// Drain the root's done queue, invoking driver callbacks with the bus
/// lock released. The caller must hold the root's private lock; `drv` is
/// the proof. Re-entrant drives (a callback completing another transfer
/// synchronously) are flattened by the queue's drive flags.
pub(crate) fn drive_done_queue<D: Send + 'static>(shared: &RootShared<D>, drv: &mut D) {
    let bus = &shared.bus;
    {
        let mut st = bus.lock_state();
        if !st.root_ctl_mut(shared.root_id).done_q.begin_drive(None) {
            return;
        }
    }
    // Every exit path below both decides to stop and releases loop
    // ownership under one bus lock acquisition. Deciding first and ending
    // the drive under a later acquisition would lose entries staged in
    // between by a thread that saw the loop as still active.
    'outer: loop {
        let prepared = {
            let mut st = bus.lock_state();
            prepare(&mut st, shared.root_id)
        };
        match prepared {
            Prepared::Exhausted => {
                let mut st = bus.lock_state();
                let q = &mut st.root_ctl_mut(shared.root_id).done_q;
                if q.end_drive() && q.begin_drive(None) {
                    continue 'outer;
                }
                return;
            }
            Prepared::Discard => {
                let mut st = bus.lock_state();
                let q = &mut st.root_ctl_mut(shared.root_id).done_q;
                q.set_current(None);
                if q.step_done() {
                    continue 'outer;
                }
                if q.end_drive() && q.begin_drive(None) {
                    continue 'outer;
                }
                return;
            }
            Prepared::Run {
                id,
                local_idx,
                state,
                mut view,
                info,
            } => {
                let callback = shared.callbacks[local_idx];
                let ops = {
                    let mut ctx = XferCtx {
                        state,
                        info,
                        view: &mut view,
                        ops: SmallVec::new(),
                    };
                    callback(drv, &mut ctx);
                    ctx.ops
                };

                let keep_going = {
                    let mut st = bus.lock_state();
                    st.xfer_mut(id).put_view(view);
                    for op in ops {
                        match op {
                            PendingOp::Submit => xfer::submit_locked(&mut st, id),
                            PendingOp::Start(o) => xfer::start_locked(&mut st, o),
                            PendingOp::Stop(o) => xfer::stop_locked(&mut st, o),
                            PendingOp::RequestStall => {
                                st.xfer_mut(id).int_flags.insert(IntFlags::STALL_REQ);
                            }
                        }
                    }
                    post_callback(&mut st, id);
                    let q = &mut st.root_ctl_mut(shared.root_id).done_q;
                    if q.step_done() {
                        true
                    } else {
                        q.end_drive() && q.begin_drive(None)
                    }
                };

                // A finished callback is what drain waits on.
                shared.drain_cv.notify_all();
                if !keep_going {
                    return;
                }
            }
        }
    }
}

/// Under the bus lock: pull the next done-queue entry and compute the final
/// state the callback observes.
fn prepare(st: &mut BusState, root: crate::RootId) -> Prepared {
    let id = match st.root_ctl_mut(root).done_q.next_step() {
        Some(id) => id,
        None => return Prepared::Exhausted,
    };
    if !st.contains_xfer(id) {
        return Prepared::Discard;
    }
    if st.xfer(id).wait_queue == Some(QueueRef::Done(root)) {
        st.xfer_mut(id).wait_queue = None;
    }

    let x = st.xfer_mut(id);
    let state = match x.phase {
        Phase::Idle => {
            if !x.int_flags.contains(IntFlags::STARTED) {
                return Prepared::Discard;
            }
            XferState::Setup
        }
        Phase::Done => match x.error {
            None => XferState::Transferred,
            Some(e) => XferState::Error(e),
        },
        phase => {
            warn!("transfer {:?} on done queue in phase {:?}", id, phase);
            return Prepared::Discard;
        }
    };

    let info = CtxInfo {
        id,
        endpoint: x.endpoint,
        ep_ty: x.ep_ty,
        direction: x.direction,
        max_packet: x.max_packet,
        bufsize: x.bufsize,
        nframes_max: x.nframes_max,
        sum_len: x.sum_len,
    };
    let local_idx = x.local_idx;
    let view = x.take_view();
    Prepared::Run {
        id,
        local_idx,
        state,
        view,
        info,
    }
}

/// Under the bus lock, after the callback returned and its requested
/// operations ran: advance the pipe unless the transfer re-submitted itself
/// or froze its pipe, and leave the transfer ready for reuse.
fn post_callback(st: &mut BusState, id: XferId) {
    let root = st.xfer(id).root;
    st.root_ctl_mut(root).done_q.set_current(None);

    let x = st.xfer_mut(id);
    // Re-submitted from its own callback, or already completed again and
    // re-queued (or held in a DMA-delay window) for another dispatch:
    // either way it is still in flight.
    let resubmitted = matches!(x.phase, Phase::DmaLoad | Phase::Queued | Phase::Transferring)
        || x.wait_queue.is_some()
        || x.int_flags.contains(IntFlags::DMA_DELAY_PENDING);
    if resubmitted {
        return;
    }
    x.int_flags.remove(IntFlags::STARTED);
    x.phase = Phase::Idle;
    let error = x.error;
    let bof = x.flags.contains(XferFlags::PIPE_BOF);
    let pid = x.pipe;

    if st.pipe(pid).queue.current() == Some(id) {
        let freeze = bof && matches!(error, Some(e) if e != UsbError::Cancelled);
        if freeze {
            debug!(
                "pipe {:?}: frozen at failed transfer {:?} ({:?})",
                pid, id, error
            );
        } else {
            st.pipe_mut(pid).queue.set_current(None);
            xfer::command_wrapper(st, QueueRef::Pipe(pid), None);
        }
    }
}
