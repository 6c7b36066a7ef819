//! Transfer descriptors and the operations that move them through their
//! lifecycle: submission, hardware handoff, completion, cancellation.
//!
//! All functions ending in `_locked` require the bus lock (they take the
//! locked [`BusState`]) and never sleep. Driver callbacks are never invoked
//! from here; completions are staged on the owning root's done queue and
//! delivered by `dispatch`.

use log::warn;
use smallvec::SmallVec;

use common::dma::DmaSlice;

use crate::control;
use crate::error::UsbError;
use crate::hw::HwXfer;
use crate::pipe;
use crate::usb::{Direction, EndpointTy};
use crate::{BusState, PipeId, RootId, XferId};

bitflags::bitflags! {
    /// Driver-visible transfer behavior flags, fixed at setup time except
    /// where a callback operation changes them.
    #[derive(Default)]
    pub struct XferFlags: u32 {
        /// A device delivering less data than requested is not an error.
        const SHORT_XFER_OK = 1 << 0;
        /// On any error other than cancellation, freeze the pipe queue at
        /// this transfer until the driver restarts it.
        const PIPE_BOF = 1 << 1;
        /// The driver sends the control STATUS stage itself, with a final
        /// dataless submission.
        const MANUAL_STATUS = 1 << 2;
        /// Assert a stall on the endpoint before the next submission is
        /// handed to hardware.
        const STALL_PIPE = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Internal state bits, only ever touched under the bus lock.
    #[derive(Default)]
    pub(crate) struct IntFlags: u32 {
        const STARTED = 1 << 0;
        const OPEN = 1 << 1;
        /// Completion held back until the DMA synchronization delay passes.
        const DMA_DELAY_PENDING = 1 << 2;
        /// The pre-start interval delay has elapsed for this cycle.
        const INTERVAL_DONE = 1 << 3;
        /// Control transaction: SETUP header goes out with this submission.
        const CTRL_HDR = 1 << 4;
        /// Control transaction is mid-flight; more submissions follow.
        const CTRL_ACT = 1 << 5;
        /// Stall the endpoint before entering hardware.
        const STALL_REQ = 1 << 6;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Phase {
    /// Configured, no cycle outstanding.
    Idle,
    /// Waiting for (or in) the DMA-load stage.
    DmaLoad,
    /// On the pipe queue, or current on it but not yet with hardware.
    Queued,
    /// Owned by the hardware until it reports done.
    Transferring,
    /// Completed; callback dispatch not yet finished.
    Done,
}

/// Which wait queue a transfer sits on. A transfer is a member of at most
/// one at a time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum QueueRef {
    Pipe(PipeId),
    DmaLoad(RootId),
    Done(RootId),
}

/// One frame buffer: requested and actual length, plus the storage when the
/// frame is not backed by the root's carve-out.
#[derive(Clone, Debug, Default)]
pub(crate) struct Frame {
    pub req_len: usize,
    pub act_len: usize,
    /// Externally supplied storage, moved in by the driver. The core never
    /// copies these bytes into the carve-out.
    pub ext: Option<Box<[u8]>>,
}

/// The parts of a transfer the driver callback works on. Checked out of the
/// arena while the callback runs (the bus lock is released meanwhile) and
/// written back afterwards, so exclusive access is visible in the types.
#[derive(Debug)]
pub(crate) struct XferView {
    pub frames: SmallVec<[Frame; 2]>,
    pub local_buf: Option<DmaSlice>,
    pub timeout_ms: u32,
}

impl XferView {
    /// Byte offset of a carve-out frame within the local buffer: external
    /// frames occupy no carve-out space.
    fn pool_offset(&self, frame: usize) -> usize {
        self.frames[..frame]
            .iter()
            .filter(|f| f.ext.is_none())
            .map(|f| f.req_len)
            .sum()
    }

    pub fn frame_bytes(&self, frame: usize) -> &[u8] {
        let f = &self.frames[frame];
        if let Some(ext) = &f.ext {
            return &ext[..f.req_len];
        }
        if f.req_len == 0 {
            return &[];
        }
        let off = self.pool_offset(frame);
        &self.local_buf.as_ref().expect("no carve-out buffer").as_slice()[off..off + f.req_len]
    }

    pub fn frame_bytes_mut(&mut self, frame: usize) -> &mut [u8] {
        let off = self.pool_offset(frame);
        let f = &mut self.frames[frame];
        let len = f.req_len;
        if let Some(ext) = &mut f.ext {
            return &mut ext[..len];
        }
        if len == 0 {
            return &mut [];
        }
        &mut self
            .local_buf
            .as_mut()
            .expect("no carve-out buffer")
            .as_mut_slice()[off..off + len]
    }

    pub fn frame_device_addr(&self, frame: usize) -> Option<u64> {
        let f = &self.frames[frame];
        if f.ext.is_some() {
            return None;
        }
        let off = self.pool_offset(frame);
        Some(self.local_buf.as_ref()?.device_addr() + off as u64)
    }
}

pub(crate) struct TransferInner {
    pub root: RootId,
    pub pipe: PipeId,
    /// Index into the owning root's callback table.
    pub local_idx: usize,

    pub endpoint: u8,
    pub direction: Direction,
    pub ep_ty: EndpointTy,
    pub max_packet: u16,

    pub bufsize: usize,
    pub nframes_max: usize,
    pub flags: XferFlags,
    pub interval_ms: u32,
    pub uses_dma: bool,

    pub int_flags: IntFlags,
    pub phase: Phase,
    pub wait_queue: Option<QueueRef>,
    pub error: Option<UsbError>,
    pub can_cancel: bool,
    pub timer_gen: u64,
    pub sum_len: usize,
    pub control_rem: usize,

    view: Option<XferView>,
}

impl TransferInner {
    pub fn new(
        root: RootId,
        pipe: PipeId,
        local_idx: usize,
        endpoint: u8,
        direction: Direction,
        ep_ty: EndpointTy,
        max_packet: u16,
        bufsize: usize,
        nframes: usize,
        flags: XferFlags,
        timeout_ms: u32,
        interval_ms: u32,
        uses_dma: bool,
        local_buf: Option<DmaSlice>,
    ) -> Self {
        let mut frames = SmallVec::new();
        frames.resize(nframes, Frame::default());
        Self {
            root,
            pipe,
            local_idx,
            endpoint,
            direction,
            ep_ty,
            max_packet,
            bufsize,
            nframes_max: nframes,
            flags,
            interval_ms,
            uses_dma,
            int_flags: IntFlags::default(),
            phase: Phase::Idle,
            wait_queue: None,
            error: None,
            can_cancel: false,
            timer_gen: 0,
            sum_len: 0,
            control_rem: 0,
            view: Some(XferView {
                frames,
                local_buf,
                timeout_ms,
            }),
        }
    }

    pub fn view(&self) -> &XferView {
        self.view.as_ref().expect("frame view checked out")
    }

    pub fn view_mut(&mut self) -> &mut XferView {
        self.view.as_mut().expect("frame view checked out")
    }

    pub fn take_view(&mut self) -> XferView {
        self.view.take().expect("frame view checked out")
    }

    pub fn put_view(&mut self, view: XferView) {
        debug_assert!(self.view.is_none());
        self.view = Some(view);
    }
}

/// Drive one of the in-lock queues (pipe or DMA-load). The done queues are
/// driven by `dispatch`, which has to release the bus lock per step.
///
/// Re-entrant calls flag the active loop and return, so a step that
/// completes one transfer and thereby queues the next never recurses.
pub(crate) fn command_wrapper(st: &mut BusState, q: QueueRef, item: Option<XferId>) {
    debug_assert!(!matches!(q, QueueRef::Done(_)));
    if let Some(id) = item {
        if let Some(x) = st.get_xfer_mut(id) {
            if x.wait_queue == Some(q) {
                x.wait_queue = None;
            }
        }
    }
    if !st.queue_mut(q).begin_drive(item) {
        return;
    }
    loop {
        let id = match st.queue_mut(q).next_step() {
            Some(id) => id,
            None => break,
        };
        if let Some(x) = st.get_xfer_mut(id) {
            if x.wait_queue == Some(q) {
                x.wait_queue = None;
            }
        }
        match q {
            QueueRef::Pipe(p) => pipe::pipe_step(st, p),
            QueueRef::DmaLoad(r) => dma_step(st, r),
            QueueRef::Done(_) => unreachable!(),
        }
        if !st.queue_mut(q).step_done() {
            break;
        }
    }
    st.queue_mut(q).end_drive();
}

/// Stage a transfer on its root's done queue and poke the deferred
/// execution context. The token channel holds at most two in-flight
/// wakeups; a full channel means one is already on its way, so the result
/// of `try_send` is deliberately ignored. Nothing on this path allocates.
pub(crate) fn queue_done_dispatch(st: &mut BusState, id: XferId) {
    let root = st.xfer(id).root;
    if st.root_ctl_mut(root).done_q.enqueue(id) {
        st.xfer_mut(id).wait_queue = Some(QueueRef::Done(root));
    }
    st.send_token(root);
}

/// Mark a transfer started and stage its one-shot dispatch so the driver
/// callback can supply buffers and lengths. Idempotent: a transfer that is
/// queued, loading, or with the hardware is left alone.
pub(crate) fn start_locked(st: &mut BusState, id: XferId) {
    let Some(x) = st.get_xfer_mut(id) else { return };
    x.int_flags.insert(IntFlags::STARTED);
    if x.phase != Phase::Idle {
        return;
    }
    let root = x.root;
    if st.root_ctl(root).done_q.current() == Some(id) {
        return;
    }
    queue_done_dispatch(st, id);
}

/// Cancel a transfer. Idempotent. Where the hardware phase allows it the
/// abort is synchronous; otherwise the sticky `Cancelled` error waits for
/// the hardware's own completion report.
pub(crate) fn stop_locked(st: &mut BusState, id: XferId) {
    let Some(x) = st.get_xfer_mut(id) else { return };
    x.int_flags.remove(IntFlags::STARTED);
    if !x.int_flags.contains(IntFlags::OPEN) {
        // Never reached hardware; a staged Setup dispatch is discarded by
        // the dispatcher when it sees the cleared started flag.
        return;
    }
    if x.error.is_none() {
        x.error = Some(UsbError::Cancelled);
    }
    match x.phase {
        Phase::Transferring => {
            x.timer_gen += 1;
            let can = x.can_cancel;
            let pid = x.pipe;
            if can {
                let ops = st.pipe(pid).methods.clone();
                ops.close(&mut HwXfer { st: &mut *st, id });
            }
        }
        Phase::Queued | Phase::DmaLoad => {
            x.timer_gen += 1;
            let pid = x.pipe;
            let wq = x.wait_queue.take();
            if let Some(q) = wq {
                st.queue_mut(q).dequeue(id);
            }
            let was_pipe_current = st.pipe(pid).queue.current() == Some(id);
            complete_locked(st, id, Some(UsbError::Cancelled));
            if was_pipe_current {
                st.pipe_mut(pid).queue.set_current(None);
                command_wrapper(st, QueueRef::Pipe(pid), None);
            }
        }
        Phase::Idle | Phase::Done => {}
    }
}

/// Validate a submission the driver requested from its callback and hand
/// the transfer to the DMA-load stage or straight to the pipe queue.
/// Validation failures complete the transfer with the error instead of
/// returning it, so the driver hears about them the same way it hears about
/// hardware failures.
pub(crate) fn submit_locked(st: &mut BusState, id: XferId) {
    let Some(x) = st.get_xfer_mut(id) else { return };
    if x.phase != Phase::Idle || !x.int_flags.contains(IntFlags::STARTED) {
        return;
    }
    // New cycle: the previous cycle's error was already delivered.
    x.error = None;
    x.int_flags.remove(IntFlags::INTERVAL_DONE);
    if x.flags.contains(XferFlags::STALL_PIPE) {
        x.int_flags.insert(IntFlags::STALL_REQ);
    }

    let mut sum: usize = 0;
    let mut pool: usize = 0;
    let mut overflow = false;
    for f in &mut x.view_mut().frames {
        f.act_len = 0;
        match sum.checked_add(f.req_len) {
            Some(s) => sum = s,
            None => {
                overflow = true;
                break;
            }
        }
        if f.ext.is_none() {
            pool += f.req_len;
        }
    }
    let over_pool = pool > x.bufsize;
    x.sum_len = sum;

    let mut control_err = None;
    if !overflow && !over_pool && x.ep_ty == EndpointTy::Ctrl {
        control_err = control::control_stage(x).err();
    }

    let pid = x.pipe;
    let root = x.root;
    let uses_dma = x.uses_dma;
    let needs_open = !x.int_flags.contains(IntFlags::OPEN);

    if overflow {
        return submit_fail(st, id, UsbError::Overflow);
    }
    if over_pool {
        return submit_fail(st, id, UsbError::InvalidParameter);
    }
    if let Some(e) = control_err {
        return submit_fail(st, id, e);
    }

    if needs_open {
        st.xfer_mut(id).int_flags.insert(IntFlags::OPEN);
        let ops = st.pipe(pid).methods.clone();
        ops.open(&mut HwXfer { st: &mut *st, id });
    }

    if uses_dma && pool > 0 {
        st.xfer_mut(id).phase = Phase::DmaLoad;
        if st.root_ctl_mut(root).dma_q.enqueue(id) {
            st.xfer_mut(id).wait_queue = Some(QueueRef::DmaLoad(root));
        }
        command_wrapper(st, QueueRef::DmaLoad(root), None);
    } else {
        st.xfer_mut(id).phase = Phase::Queued;
        queue_on_pipe(st, pid, id);
    }
}

/// Hand a transfer to its pipe. A transfer restarting in place (it is
/// still the pipe's current item, e.g. after freezing the pipe on an
/// error) is re-driven directly instead of queued behind itself.
pub(crate) fn queue_on_pipe(st: &mut BusState, pid: PipeId, id: XferId) {
    if st.pipe(pid).queue.current() == Some(id) {
        command_wrapper(st, QueueRef::Pipe(pid), Some(id));
    } else {
        if st.pipe_mut(pid).queue.enqueue(id) {
            st.xfer_mut(id).wait_queue = Some(QueueRef::Pipe(pid));
        }
        command_wrapper(st, QueueRef::Pipe(pid), None);
    }
}

fn submit_fail(st: &mut BusState, id: XferId, error: UsbError) {
    warn!("transfer {:?}: rejected at submit: {}", id, error);
    complete_locked(st, id, Some(error));
}

/// Hardware completion entry point. No-op unless the transfer is currently
/// with the hardware, which makes duplicate reports and reports racing a
/// synchronous cancel harmless.
pub(crate) fn done_locked(st: &mut BusState, id: XferId, error: Option<UsbError>) {
    let Some(x) = st.get_xfer(id) else { return };
    if x.phase != Phase::Transferring {
        return;
    }
    complete_locked(st, id, error);
}

/// Terminal bookkeeping shared by hardware completions, submit rejections
/// and queued-transfer cancellation: record the first error, stop the
/// timer, leave the DMA-load stage, count, and stage callback dispatch
/// (possibly after the DMA synchronization delay).
pub(crate) fn complete_locked(st: &mut BusState, id: XferId, reported: Option<UsbError>) {
    let root;
    let error;
    let mut leave_dma = false;
    {
        let x = st.xfer_mut(id);
        x.phase = Phase::Done;
        if x.error.is_none() {
            x.error = reported;
        }
        if x.error.is_none() {
            // Per-frame actuals are final here. A controller writing past
            // what was asked for has corrupted memory; that is not a
            // protocol error.
            let mut actual = 0usize;
            for f in &x.view().frames {
                assert!(
                    f.act_len <= f.req_len,
                    "controller reported more data than requested"
                );
                actual += f.act_len;
            }
            if actual < x.sum_len && !x.flags.contains(XferFlags::SHORT_XFER_OK) {
                x.error = Some(UsbError::ShortTransfer);
            }
        }
        error = x.error;
        x.timer_gen += 1;
        x.can_cancel = false;
        if x.ep_ty == EndpointTy::Ctrl && x.error.is_some() {
            // A failed control transaction starts over from the header.
            x.int_flags.remove(IntFlags::CTRL_HDR | IntFlags::CTRL_ACT);
            x.control_rem = 0;
        }
        root = x.root;
        if x.wait_queue == Some(QueueRef::DmaLoad(root)) {
            x.wait_queue = None;
            leave_dma = true;
        }
    }
    if leave_dma {
        st.root_ctl_mut(root).dma_q.dequeue(id);
    }
    if st.root_ctl(root).dma_q.current() == Some(id) {
        st.root_ctl_mut(root).dma_q.set_current(None);
        command_wrapper(st, QueueRef::DmaLoad(root), None);
    }

    let ep_ty = st.xfer(id).ep_ty;
    let stats = st.stats_mut(ep_ty);
    if error.is_some() {
        stats.err += 1;
    } else {
        stats.ok += 1;
    }

    // Cancelled or timed-out transfers may still have in-flight DMA; hold
    // the callback back until the bus says the hardware has let go.
    let delay = st.dma_delay_ms();
    if delay > 0 && matches!(error, Some(UsbError::Cancelled) | Some(UsbError::Timeout)) {
        let x = st.xfer_mut(id);
        x.int_flags.insert(IntFlags::DMA_DELAY_PENDING);
        st.arm_dma_delay(id, delay);
        return;
    }
    queue_done_dispatch(st, id);
}

/// Whether any queue, timer window, or piece of hardware still references
/// the transfer. The only safe precondition for reusing or freeing its
/// buffers is this returning false after a stop.
pub(crate) fn pending_locked(st: &BusState, id: XferId) -> bool {
    let Some(x) = st.get_xfer(id) else { return false };
    if matches!(x.phase, Phase::DmaLoad | Phase::Queued | Phase::Transferring) {
        return true;
    }
    if x.wait_queue.is_some() {
        return true;
    }
    if x.int_flags.contains(IntFlags::DMA_DELAY_PENDING) {
        return true;
    }
    st.root_ctl(x.root).done_q.current() == Some(id)
}

/// DMA-load step. The portable carve-out is permanently resident, so the
/// load completes synchronously; an asynchronous backend would park the
/// queue here until its load callback re-drives it.
pub(crate) fn dma_step(st: &mut BusState, root: RootId) {
    let Some(id) = st.root_ctl(root).dma_q.current() else { return };
    let loading = st
        .get_xfer(id)
        .map_or(false, |x| x.phase == Phase::DmaLoad);
    if !loading {
        st.root_ctl_mut(root).dma_q.set_current(None);
        return;
    }
    let x = st.xfer_mut(id);
    x.phase = Phase::Queued;
    let pid = x.pipe;
    st.root_ctl_mut(root).dma_q.set_current(None);
    queue_on_pipe(st, pid, id);
}

/// Timeout callout fired: behaves like an interrupt-context cancellation
/// with `Timeout` as the sticky error.
pub(crate) fn timeout_fired(st: &mut BusState, id: XferId, gen: u64) {
    let Some(x) = st.get_xfer_mut(id) else { return };
    if x.timer_gen != gen || x.phase != Phase::Transferring {
        return;
    }
    if x.error.is_none() {
        x.error = Some(UsbError::Timeout);
    }
    if x.can_cancel {
        let pid = x.pipe;
        let ops = st.pipe(pid).methods.clone();
        ops.close(&mut HwXfer { st: &mut *st, id });
    }
    // Not cancelable right now: the hardware's own completion will deliver
    // the recorded error.
}

/// Pre-start interval elapsed: resume driving the pipe.
pub(crate) fn interval_fired(st: &mut BusState, id: XferId, gen: u64) {
    let Some(x) = st.get_xfer_mut(id) else { return };
    if x.timer_gen != gen || x.phase != Phase::Queued {
        return;
    }
    x.int_flags.insert(IntFlags::INTERVAL_DONE);
    let pid = x.pipe;
    if st.pipe(pid).queue.current() == Some(id) {
        command_wrapper(st, QueueRef::Pipe(pid), None);
    }
}

/// DMA synchronization delay elapsed: the held-back completion may now be
/// dispatched.
pub(crate) fn dma_delay_fired(st: &mut BusState, id: XferId, gen: u64) {
    let Some(x) = st.get_xfer_mut(id) else { return };
    if x.timer_gen != gen || !x.int_flags.contains(IntFlags::DMA_DELAY_PENDING) {
        return;
    }
    x.int_flags.remove(IntFlags::DMA_DELAY_PENDING);
    queue_done_dispatch(st, id);
}
