//! The capability table a host-controller family implements per pipe, and
//! the bus-locked view it is handed for each call.

use crate::error::UsbError;
use crate::usb::{Direction, EndpointTy};
use crate::xfer;
use crate::{BusState, PipeId, XferId};

/// Hardware operations for one endpoint direction.
///
/// Every method is invoked with the bus lock held; implementations must do
/// all their work through the provided [`HwXfer`] view and must not call
/// back into the bus object. Completion is reported either synchronously
/// via [`HwXfer::done`] or later, from interrupt context, through
/// [`UsbBus::hw_access`](crate::UsbBus::hw_access).
pub trait PipeMethods: Send + Sync {
    /// Acquire per-transfer hardware resources. Called at most once per
    /// transfer lifetime, before the first `enter`.
    fn open(&self, xfer: &mut HwXfer<'_>);

    /// Release hardware resources and abort any outstanding work. When the
    /// transfer is mid-flight this must lead to a completion report.
    fn close(&self, xfer: &mut HwXfer<'_>);

    /// Queue the transfer's work with the hardware.
    fn enter(&self, xfer: &mut HwXfer<'_>);

    /// Kick the hardware to begin executing queued work.
    fn start(&self, xfer: &mut HwXfer<'_>);

    /// Assert the HALT condition on the endpoint.
    fn set_stall(&self, pipe: PipeId);

    /// Whether a transfer in the `enter` phase can be aborted immediately.
    fn enter_is_cancelable(&self) -> bool;

    /// Whether a transfer handed to `start` can be aborted immediately.
    fn start_is_cancelable(&self) -> bool;

    /// Whether buffers must pass the driver-managed DMA-load stage before
    /// submission.
    fn uses_dma_load(&self) -> bool;
}

/// One transfer as the hardware sees it. Borrowed from the locked bus state
/// for the duration of a capability call or an `hw_access` closure.
pub struct HwXfer<'a> {
    pub(crate) st: &'a mut BusState,
    pub(crate) id: XferId,
}

impl HwXfer<'_> {
    pub fn id(&self) -> XferId {
        self.id
    }

    pub fn endpoint(&self) -> u8 {
        self.st.xfer(self.id).endpoint
    }

    pub fn direction(&self) -> Direction {
        self.st.xfer(self.id).direction
    }

    pub fn ep_type(&self) -> EndpointTy {
        self.st.xfer(self.id).ep_ty
    }

    pub fn max_packet_size(&self) -> u16 {
        self.st.xfer(self.id).max_packet
    }

    pub fn num_frames(&self) -> usize {
        self.st.xfer(self.id).view().frames.len()
    }

    pub fn frame_len(&self, frame: usize) -> usize {
        self.st.xfer(self.id).view().frames[frame].req_len
    }

    /// Total requested length across all frames, as validated at submit.
    pub fn sum_len(&self) -> usize {
        self.st.xfer(self.id).sum_len
    }

    /// Device address of a frame backed by the root's DMA carve-out; `None`
    /// for externally supplied frames, whose pages the controller reaches
    /// through its own mapping of the boxed buffer.
    pub fn frame_device_addr(&self, frame: usize) -> Option<u64> {
        self.st.xfer(self.id).view().frame_device_addr(frame)
    }

    pub fn frame_bytes(&self, frame: usize) -> &[u8] {
        self.st.xfer(self.id).view().frame_bytes(frame)
    }

    pub fn frame_bytes_mut(&mut self, frame: usize) -> &mut [u8] {
        self.st.xfer_mut(self.id).view_mut().frame_bytes_mut(frame)
    }

    /// Record how many bytes the hardware moved for one frame.
    pub fn set_act_len(&mut self, frame: usize, len: usize) {
        let view = self.st.xfer_mut(self.id).view_mut();
        view.frames[frame].act_len = len;
    }

    /// Whether the control sub-machine expects the SETUP header to be sent
    /// as part of this submission.
    pub fn control_header_pending(&self) -> bool {
        self.st
            .xfer(self.id)
            .int_flags
            .contains(xfer::IntFlags::CTRL_HDR)
    }

    /// Whether the control transaction continues after this submission
    /// (more data stages, or a driver-managed status stage).
    pub fn control_active(&self) -> bool {
        self.st
            .xfer(self.id)
            .int_flags
            .contains(xfer::IntFlags::CTRL_ACT)
    }

    /// Report completion. No-op unless the transfer is with the hardware,
    /// so a late report after cancellation is harmless.
    pub fn done(&mut self, error: Option<UsbError>) {
        xfer::done_locked(self.st, self.id, error);
    }
}
