//! Staging logic for control transfers: SETUP header, data stages, and the
//! automatic STATUS stage.
//!
//! A control transaction may span several submissions of the same transfer.
//! The first one carries the 8-byte SETUP header in frame 0 and fixes the
//! total data length from `wLength`; follow-up submissions carry data only.
//! Once the remaining count hits zero the hardware appends the STATUS stage
//! on its own, unless the driver asked to send it manually with a final
//! dataless submission.

use log::trace;

use crate::error::UsbError;
use crate::usb::{EndpointTy, Setup, SETUP_LEN};
use crate::xfer::{IntFlags, TransferInner, XferFlags};

/// Validate and account one submission of a control transfer. Called from
/// the submit path with the bus lock held; the frame layout was already
/// bounds-checked against the carve-out.
pub(crate) fn control_stage(x: &mut TransferInner) -> Result<(), UsbError> {
    debug_assert_eq!(x.ep_ty, EndpointTy::Ctrl);

    let header;
    if !x.int_flags.contains(IntFlags::CTRL_ACT) {
        // New transaction: frame 0 must hold exactly the full header.
        let view = x.view();
        if view.frames.is_empty() || view.frames[0].req_len != SETUP_LEN {
            return Err(UsbError::InvalidParameter);
        }
        let setup = Setup::read_from(view.frame_bytes(0)).ok_or(UsbError::InvalidParameter)?;
        x.control_rem = { setup.length } as usize;
        x.int_flags.insert(IntFlags::CTRL_HDR | IntFlags::CTRL_ACT);
        header = true;
    } else {
        // Continuation of an open transaction: data frames only.
        x.int_flags.remove(IntFlags::CTRL_HDR);
        header = false;
    }

    let data_start = if header { 1 } else { 0 };
    let view = x.view();
    let data_frames = view.frames.len().saturating_sub(data_start);
    let data_len: usize = view.frames[data_start..].iter().map(|f| f.req_len).sum();

    if data_len > x.control_rem {
        return Err(UsbError::InvalidParameter);
    }

    // A partial data stage must be either exactly one max packet or
    // everything that remains; anything else split over several frames has
    // historically confused controllers, so it is rejected outright.
    if data_len != x.control_rem
        && data_len != usize::from(x.max_packet)
        && data_frames > 1
    {
        return Err(UsbError::InvalidParameter);
    }

    x.control_rem -= data_len;

    let manual = x.flags.contains(XferFlags::MANUAL_STATUS);
    if x.control_rem == 0 {
        if !manual {
            // Hardware sends STATUS after this submission.
            x.int_flags.remove(IntFlags::CTRL_ACT);
        } else if !header && data_len == 0 {
            // The driver's explicit status submission.
            x.int_flags.remove(IntFlags::CTRL_ACT);
        }
    }

    trace!(
        "control stage: header={} data_len={} rem={} active={}",
        header,
        data_len,
        x.control_rem,
        x.int_flags.contains(IntFlags::CTRL_ACT)
    );
    Ok(())
}

/// Default frame count for a control transfer configured with zero frames:
/// one frame when the buffer only fits the header, else header plus one
/// more stage.
pub(crate) fn default_control_frames(bufsize: usize) -> usize {
    if bufsize <= SETUP_LEN {
        1
    } else {
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::Direction;
    use crate::{PipeId, RootId};

    fn control_xfer(bufsize: usize, nframes: usize, flags: XferFlags) -> TransferInner {
        let mut x = TransferInner::new(
            RootId(0),
            PipeId(0),
            0,
            0,
            Direction::Out,
            EndpointTy::Ctrl,
            64,
            bufsize,
            nframes,
            flags,
            0,
            0,
            false,
            None,
        );
        // Tests poke frame lengths directly; external storage stands in for
        // the carve-out.
        for f in &mut x.view_mut().frames {
            f.ext = Some(vec![0u8; bufsize.max(SETUP_LEN)].into_boxed_slice());
        }
        x
    }

    fn write_header(x: &mut TransferInner, length: u16) {
        x.view_mut().frames[0].req_len = SETUP_LEN;
        let mut setup = Setup::get_status();
        setup.length = length;
        setup.write_to(x.view_mut().frame_bytes_mut(0));
    }

    #[test]
    fn header_only_transaction_completes() {
        let mut x = control_xfer(8, 1, XferFlags::default());
        write_header(&mut x, 0);
        control_stage(&mut x).unwrap();
        assert!(x.int_flags.contains(IntFlags::CTRL_HDR));
        assert!(!x.int_flags.contains(IntFlags::CTRL_ACT));
    }

    #[test]
    fn data_accounted_against_remaining() {
        let mut x = control_xfer(64, 2, XferFlags::default());
        write_header(&mut x, 16);
        x.view_mut().frames[1].req_len = 16;
        control_stage(&mut x).unwrap();
        assert_eq!(x.control_rem, 0);
        assert!(!x.int_flags.contains(IntFlags::CTRL_ACT));
    }

    #[test]
    fn oversized_data_stage_rejected() {
        let mut x = control_xfer(64, 2, XferFlags::default());
        write_header(&mut x, 8);
        x.view_mut().frames[1].req_len = 16;
        assert_eq!(control_stage(&mut x), Err(UsbError::InvalidParameter));
    }

    #[test]
    fn missing_header_rejected() {
        let mut x = control_xfer(64, 2, XferFlags::default());
        x.view_mut().frames[0].req_len = 4;
        assert_eq!(control_stage(&mut x), Err(UsbError::InvalidParameter));
    }

    #[test]
    fn partial_stage_keeps_transaction_active() {
        let mut x = control_xfer(200, 2, XferFlags::default());
        write_header(&mut x, 128);
        // First stage: one max packet of the 128 bytes.
        x.view_mut().frames[1].req_len = 64;
        control_stage(&mut x).unwrap();
        assert_eq!(x.control_rem, 64);
        assert!(x.int_flags.contains(IntFlags::CTRL_ACT));

        // Continuation carries the rest; no header this time.
        x.view_mut().frames[0].req_len = 0;
        x.view_mut().frames[1].req_len = 64;
        control_stage(&mut x).unwrap();
        assert!(!x.int_flags.contains(IntFlags::CTRL_HDR));
        assert_eq!(x.control_rem, 0);
        assert!(!x.int_flags.contains(IntFlags::CTRL_ACT));
    }

    #[test]
    fn odd_partial_stage_rejected() {
        let mut x = control_xfer(200, 3, XferFlags::default());
        write_header(&mut x, 128);
        // 100 bytes is neither one max packet nor the full remainder, and
        // it spans more than one frame.
        x.view_mut().frames[1].req_len = 50;
        x.view_mut().frames[2].req_len = 50;
        assert_eq!(control_stage(&mut x), Err(UsbError::InvalidParameter));
    }

    #[test]
    fn manual_status_needs_explicit_submission() {
        let mut x = control_xfer(64, 2, XferFlags::MANUAL_STATUS);
        write_header(&mut x, 16);
        x.view_mut().frames[1].req_len = 16;
        control_stage(&mut x).unwrap();
        assert!(x.int_flags.contains(IntFlags::CTRL_ACT));

        // Dataless follow-up triggers the status stage.
        x.view_mut().frames[0].req_len = 0;
        x.view_mut().frames[1].req_len = 0;
        control_stage(&mut x).unwrap();
        assert!(!x.int_flags.contains(IntFlags::CTRL_ACT));
    }

    #[test]
    fn default_frame_counts() {
        assert_eq!(default_control_frames(0), 1);
        assert_eq!(default_control_frames(8), 1);
        assert_eq!(default_control_frames(9), 2);
        assert_eq!(default_control_frames(512), 2);
    }
}
