//! End-to-end tests of the transfer core against a mock host controller.
//! The mock plays the hardware role through the capability table; a second
//! thread (or `hw_access` from the test body) plays interrupt context.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use driver_transfer::{
    transfer_setup, BusConfig, DirSpec, Direction, EndpointAddr, EndpointDesc, EndpointTy, HwXfer,
    PipeId, PipeMethods, Setup, TransferConfig, TransferRoot, UsbBus, UsbError, XferCtx, XferFlags,
    XferId, XferState,
};

#[derive(Clone, Copy, Debug)]
enum Mode {
    /// Record started transfers; the test completes them via `hw_access`.
    Record,
    /// Complete synchronously with full length; IN frames filled with a
    /// pattern when `fill` is set.
    Complete,
    /// Complete synchronously with a short first frame.
    CompleteShort(usize),
    /// Complete synchronously with the given error.
    Fail(UsbError),
}

struct MockHc {
    mode: Mutex<Mode>,
    cancelable: bool,
    uses_dma: bool,
    fill: bool,
    opened: Mutex<Vec<XferId>>,
    closed: Mutex<Vec<XferId>>,
    started: Mutex<Vec<XferId>>,
    stalls: Mutex<Vec<PipeId>>,
}

impl MockHc {
    fn new(mode: Mode, cancelable: bool) -> Arc<Self> {
        Arc::new(Self::bare(mode, cancelable))
    }

    fn with_dma(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            uses_dma: true,
            ..Self::bare(mode, true)
        })
    }

    fn with_fill(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            fill: true,
            ..Self::bare(mode, true)
        })
    }

    fn bare(mode: Mode, cancelable: bool) -> Self {
        Self {
            mode: Mutex::new(mode),
            cancelable,
            uses_dma: false,
            fill: false,
            opened: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
            stalls: Mutex::new(Vec::new()),
        }
    }

    fn started_ids(&self) -> Vec<XferId> {
        self.started.lock().unwrap().clone()
    }
}

impl PipeMethods for MockHc {
    fn open(&self, xfer: &mut HwXfer<'_>) {
        self.opened.lock().unwrap().push(xfer.id());
    }

    fn close(&self, xfer: &mut HwXfer<'_>) {
        self.closed.lock().unwrap().push(xfer.id());
        // Abort: report completion with whatever error is already recorded.
        xfer.done(None);
    }

    fn enter(&self, _xfer: &mut HwXfer<'_>) {}

    fn start(&self, xfer: &mut HwXfer<'_>) {
        self.started.lock().unwrap().push(xfer.id());
        match *self.mode.lock().unwrap() {
            Mode::Record => {}
            Mode::Complete => {
                for i in 0..xfer.num_frames() {
                    let len = xfer.frame_len(i);
                    if self.fill && len > 0 {
                        xfer.frame_bytes_mut(i).fill(0xA5);
                    }
                    xfer.set_act_len(i, len);
                }
                xfer.done(None);
            }
            Mode::CompleteShort(act) => {
                xfer.set_act_len(0, act);
                xfer.done(None);
            }
            Mode::Fail(e) => {
                xfer.done(Some(e));
            }
        }
    }

    fn set_stall(&self, pipe: PipeId) {
        self.stalls.lock().unwrap().push(pipe);
    }

    fn enter_is_cancelable(&self) -> bool {
        self.cancelable
    }

    fn start_is_cancelable(&self) -> bool {
        self.cancelable
    }

    fn uses_dma_load(&self) -> bool {
        self.uses_dma
    }
}

type Outcome = Result<usize, UsbError>;

#[derive(Default)]
struct TestDriver {
    req_len: usize,
    payload: Option<Vec<u8>>,
    wlength: u16,
    setup_calls: usize,
    events: Vec<(XferId, Outcome)>,
    data_seen: Vec<u8>,
}

fn bulk_cb(d: &mut TestDriver, ctx: &mut XferCtx<'_>) {
    match ctx.state() {
        XferState::Setup => {
            d.setup_calls += 1;
            ctx.set_frame_len(0, d.req_len);
            if let Some(payload) = &d.payload {
                let data = payload.clone();
                ctx.copy_in(0, 0, &data);
            }
            ctx.submit();
        }
        XferState::Transferred => {
            if ctx.direction() == Direction::In {
                d.data_seen = ctx.frame(0)[..ctx.frame_act_len(0)].to_vec();
            }
            d.events.push((ctx.id(), Ok(ctx.actual_length())));
        }
        XferState::Error(e) => {
            d.events.push((ctx.id(), Err(e)));
        }
    }
}

fn ctrl_cb(d: &mut TestDriver, ctx: &mut XferCtx<'_>) {
    match ctx.state() {
        XferState::Setup => {
            d.setup_calls += 1;
            let mut setup = Setup::get_status();
            setup.length = d.wlength;
            ctx.write_setup(&setup);
            if d.wlength > 0 {
                ctx.set_frame_len(1, usize::from(d.wlength));
            } else if ctx.num_frames() > 1 {
                ctx.set_frame_len(1, 0);
            }
            ctx.submit();
        }
        XferState::Transferred => {
            if d.wlength > 0 {
                d.data_seen = ctx.frame(1)[..ctx.frame_act_len(1)].to_vec();
            }
            d.events.push((ctx.id(), Ok(ctx.actual_length())));
        }
        XferState::Error(e) => {
            d.events.push((ctx.id(), Err(e)));
        }
    }
}

fn overflow_cb(d: &mut TestDriver, ctx: &mut XferCtx<'_>) {
    match ctx.state() {
        XferState::Setup => {
            d.setup_calls += 1;
            ctx.set_frames(2);
            ctx.set_frame_len(0, usize::MAX);
            ctx.set_frame_len(1, usize::MAX);
            ctx.submit();
        }
        XferState::Transferred => {
            d.events.push((ctx.id(), Ok(ctx.actual_length())));
        }
        XferState::Error(e) => {
            d.events.push((ctx.id(), Err(e)));
        }
    }
}

fn stall_clear_cb(d: &mut TestDriver, ctx: &mut XferCtx<'_>) {
    match ctx.state() {
        XferState::Setup => {
            d.setup_calls += 1;
            // No data to move; the submission only exists to assert the
            // stall.
            ctx.set_frames(0);
            ctx.submit();
        }
        XferState::Transferred => {
            d.events.push((ctx.id(), Ok(ctx.actual_length())));
        }
        XferState::Error(e) => {
            d.events.push((ctx.id(), Err(e)));
        }
    }
}

fn bulk_pipe(bus: &Arc<UsbBus>, hc: &Arc<MockHc>, direction: Direction) -> PipeId {
    bus.attach_pipe(
        EndpointDesc {
            number: 2,
            ty: EndpointTy::Bulk,
            direction,
            max_packet_size: 512,
        },
        hc.clone() as Arc<dyn PipeMethods>,
    )
}

fn bulk_config(bufsize: usize, flags: XferFlags, timeout_ms: u32) -> TransferConfig<TestDriver> {
    TransferConfig {
        ty: EndpointTy::Bulk,
        endpoint: EndpointAddr::Any,
        direction: DirSpec::Any,
        bufsize,
        frames: 1,
        flags,
        timeout_ms,
        interval_ms: 0,
        callback: bulk_cb,
    }
}

fn wait_events(root: &TransferRoot<TestDriver>, n: usize) -> Vec<(XferId, Outcome)> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        {
            let guard = root.lock();
            if guard.events.len() >= n {
                return guard.events.clone();
            }
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {} events",
            n
        );
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn bulk_out_completes_with_full_length() {
    let bus = UsbBus::new(BusConfig::default());
    let hc = MockHc::new(Mode::Complete, true);
    let pipe = bulk_pipe(&bus, &hc, Direction::Out);

    let driver = TestDriver {
        req_len: 512,
        payload: Some(vec![0x5A; 512]),
        ..TestDriver::default()
    };
    let (root, ids) = transfer_setup(
        &bus,
        &[pipe],
        &[bulk_config(512, XferFlags::default(), 0)],
        driver,
    )
    .unwrap();

    root.lock().start(ids[0]);

    let events = wait_events(&root, 1);
    assert_eq!(events, vec![(ids[0], Ok(512))]);
    assert_eq!(hc.started_ids(), ids);
    assert_eq!(bus.stats(EndpointTy::Bulk).ok, 1);
    assert_eq!(bus.stats(EndpointTy::Bulk).err, 0);
    root.unsetup();
}

#[test]
fn short_bulk_in_is_an_error_unless_allowed() {
    let bus = UsbBus::new(BusConfig::default());
    let hc = MockHc::new(Mode::CompleteShort(100), true);
    let pipe = bulk_pipe(&bus, &hc, Direction::In);

    let driver = TestDriver {
        req_len: 512,
        ..TestDriver::default()
    };
    let (root, ids) = transfer_setup(
        &bus,
        &[pipe],
        &[bulk_config(512, XferFlags::default(), 0)],
        driver,
    )
    .unwrap();

    root.lock().start(ids[0]);
    let events = wait_events(&root, 1);
    assert_eq!(events, vec![(ids[0], Err(UsbError::ShortTransfer))]);
    assert_eq!(bus.stats(EndpointTy::Bulk).err, 1);
}

#[test]
fn short_bulk_in_allowed_when_flagged() {
    let bus = UsbBus::new(BusConfig::default());
    let hc = MockHc::new(Mode::CompleteShort(100), true);
    let pipe = bulk_pipe(&bus, &hc, Direction::In);

    let driver = TestDriver {
        req_len: 512,
        ..TestDriver::default()
    };
    let (root, ids) = transfer_setup(
        &bus,
        &[pipe],
        &[bulk_config(512, XferFlags::SHORT_XFER_OK, 0)],
        driver,
    )
    .unwrap();

    root.lock().start(ids[0]);
    let events = wait_events(&root, 1);
    assert_eq!(events, vec![(ids[0], Ok(100))]);
}

#[test]
fn start_is_idempotent_while_in_flight() {
    let bus = UsbBus::new(BusConfig::default());
    let hc = MockHc::new(Mode::Record, true);
    let pipe = bulk_pipe(&bus, &hc, Direction::Out);

    let driver = TestDriver {
        req_len: 64,
        ..TestDriver::default()
    };
    let (root, ids) = transfer_setup(
        &bus,
        &[pipe],
        &[bulk_config(64, XferFlags::default(), 0)],
        driver,
    )
    .unwrap();

    {
        let mut guard = root.lock();
        guard.start(ids[0]);
        guard.start(ids[0]);
        assert_eq!(guard.setup_calls, 1);
    }
    assert_eq!(hc.started_ids().len(), 1);

    bus.hw_access(ids[0], |hw| {
        hw.set_act_len(0, 64);
        hw.done(None);
    });
    let events = wait_events(&root, 1);
    assert_eq!(events, vec![(ids[0], Ok(64))]);
}

#[test]
fn stop_of_noncancelable_transfer_waits_for_hardware() {
    let bus = UsbBus::new(BusConfig::default());
    let hc = MockHc::new(Mode::Record, false);
    let pipe = bulk_pipe(&bus, &hc, Direction::Out);

    let driver = TestDriver {
        req_len: 512,
        ..TestDriver::default()
    };
    let (root, ids) = transfer_setup(
        &bus,
        &[pipe],
        &[bulk_config(512, XferFlags::default(), 0)],
        driver,
    )
    .unwrap();
    let id = ids[0];

    root.lock().start(id);
    assert_eq!(hc.started_ids(), vec![id]);

    {
        let mut guard = root.lock();
        guard.stop(id);
        // Not cancelable: no close, no completion yet.
        assert!(hc.closed.lock().unwrap().is_empty());
        assert!(guard.pending(id));
    }

    // Hardware eventually reports success; the sticky cancel must win.
    let bus2 = bus.clone();
    let hw_thread = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        bus2.hw_access(id, |hw| {
            hw.set_act_len(0, 512);
            hw.done(None);
        });
    });

    {
        let mut guard = root.lock();
        guard.drain(id);
        assert!(!guard.pending(id));
    }
    hw_thread.join().unwrap();

    let events = wait_events(&root, 1);
    assert_eq!(events, vec![(id, Err(UsbError::Cancelled))]);
}

#[test]
fn cancelable_stop_completes_synchronously() {
    let bus = UsbBus::new(BusConfig::default());
    let hc = MockHc::new(Mode::Record, true);
    let pipe = bulk_pipe(&bus, &hc, Direction::Out);

    let driver = TestDriver {
        req_len: 512,
        ..TestDriver::default()
    };
    let (root, ids) = transfer_setup(
        &bus,
        &[pipe],
        &[bulk_config(512, XferFlags::default(), 0)],
        driver,
    )
    .unwrap();
    let id = ids[0];

    {
        let mut guard = root.lock();
        guard.start(id);
        guard.stop(id);
        // Synchronous close path: the callback already ran on this thread.
        assert_eq!(guard.events, vec![(id, Err(UsbError::Cancelled))]);
        assert!(!guard.pending(id));
        guard.drain(id);
    }
    assert_eq!(hc.closed.lock().unwrap().clone(), vec![id]);
}

#[test]
fn pipe_preserves_fifo_order() {
    let bus = UsbBus::new(BusConfig::default());
    let hc = MockHc::new(Mode::Record, true);
    let pipe = bulk_pipe(&bus, &hc, Direction::Out);

    let driver = TestDriver {
        req_len: 64,
        ..TestDriver::default()
    };
    let (root, ids) = transfer_setup(
        &bus,
        &[pipe],
        &[
            bulk_config(64, XferFlags::default(), 0),
            bulk_config(64, XferFlags::default(), 0),
        ],
        driver,
    )
    .unwrap();

    {
        let mut guard = root.lock();
        guard.start(ids[0]);
        guard.start(ids[1]);
    }
    // Second transfer queues behind the first.
    assert_eq!(hc.started_ids(), vec![ids[0]]);

    bus.hw_access(ids[0], |hw| {
        hw.set_act_len(0, 64);
        hw.done(None);
    });
    let events = wait_events(&root, 1);
    assert_eq!(events[0].0, ids[0]);

    // Completion advanced the pipe to the next queued transfer.
    let deadline = Instant::now() + Duration::from_secs(5);
    while hc.started_ids().len() < 2 {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(hc.started_ids(), vec![ids[0], ids[1]]);

    bus.hw_access(ids[1], |hw| {
        hw.set_act_len(0, 64);
        hw.done(None);
    });
    let events = wait_events(&root, 2);
    assert_eq!(events[1].0, ids[1]);
}

#[test]
fn setup_unsetup_roundtrip_without_start() {
    let bus = UsbBus::new(BusConfig::default());
    let hc = MockHc::new(Mode::Record, true);
    let pipe = bulk_pipe(&bus, &hc, Direction::Out);

    let driver = TestDriver::default();
    let (root, ids) = transfer_setup(
        &bus,
        &[pipe],
        &[
            bulk_config(512, XferFlags::default(), 0),
            bulk_config(512, XferFlags::default(), 0),
        ],
        driver,
    )
    .unwrap();
    assert_eq!(ids.len(), 2);
    root.unsetup();

    // All references released: the pipe can be detached.
    bus.detach_pipe(pipe).unwrap();
    assert!(hc.started_ids().is_empty());
}

#[test]
fn zero_length_control_gets_one_frame() {
    let bus = UsbBus::new(BusConfig::default());
    let hc = MockHc::new(Mode::Complete, true);
    let pipe = bus.attach_pipe(
        EndpointDesc {
            number: 0,
            ty: EndpointTy::Ctrl,
            direction: Direction::Out,
            max_packet_size: 64,
        },
        hc.clone() as Arc<dyn PipeMethods>,
    );

    let driver = TestDriver {
        wlength: 0,
        ..TestDriver::default()
    };
    let configs = [TransferConfig {
        ty: EndpointTy::Ctrl,
        endpoint: EndpointAddr::Num(0),
        direction: DirSpec::Any,
        bufsize: 8,
        frames: 0,
        flags: XferFlags::default(),
        timeout_ms: 0,
        interval_ms: 0,
        callback: ctrl_cb,
    }];
    let (root, ids) = transfer_setup(&bus, &[pipe], &configs, driver).unwrap();

    {
        let mut guard = root.lock();
        guard.start(ids[0]);
    }
    let events = wait_events(&root, 1);
    // Header only: 8 bytes moved, single frame.
    assert_eq!(events, vec![(ids[0], Ok(8))]);
    assert_eq!(bus.stats(EndpointTy::Ctrl).ok, 1);
}

#[test]
fn control_in_data_reaches_the_driver() {
    let bus = UsbBus::new(BusConfig::default());
    let hc = MockHc::with_fill(Mode::Complete);
    let pipe = bus.attach_pipe(
        EndpointDesc {
            number: 0,
            ty: EndpointTy::Ctrl,
            direction: Direction::Out,
            max_packet_size: 64,
        },
        hc.clone() as Arc<dyn PipeMethods>,
    );

    let driver = TestDriver {
        wlength: 16,
        ..TestDriver::default()
    };
    let configs = [TransferConfig {
        ty: EndpointTy::Ctrl,
        endpoint: EndpointAddr::Num(0),
        direction: DirSpec::Any,
        bufsize: 8 + 16,
        frames: 2,
        flags: XferFlags::default(),
        timeout_ms: 0,
        interval_ms: 0,
        callback: ctrl_cb,
    }];
    let (root, ids) = transfer_setup(&bus, &[pipe], &configs, driver).unwrap();

    root.lock().start(ids[0]);
    let events = wait_events(&root, 1);
    assert_eq!(events, vec![(ids[0], Ok(24))]);
    assert_eq!(root.lock().data_seen, vec![0xA5; 16]);
}

#[test]
fn stall_request_blocks_pipe_until_cleared() {
    let bus = UsbBus::new(BusConfig::default());
    let hc = MockHc::new(Mode::Record, true);
    let pipe = bulk_pipe(&bus, &hc, Direction::Out);

    let driver = TestDriver::default();
    let configs = [TransferConfig {
        ty: EndpointTy::Bulk,
        endpoint: EndpointAddr::Any,
        direction: DirSpec::Any,
        bufsize: 0,
        frames: 1,
        flags: XferFlags::STALL_PIPE,
        timeout_ms: 0,
        interval_ms: 0,
        callback: stall_clear_cb,
    }];
    let (root, ids) = transfer_setup(&bus, &[pipe], &configs, driver).unwrap();

    root.lock().start(ids[0]);
    // The pipe asserted the stall and parked the transfer.
    assert_eq!(hc.stalls.lock().unwrap().clone(), vec![pipe]);
    assert!(bus.pipe_stalled(pipe));
    assert!(root.lock().events.is_empty());

    // An out-of-band clear-stall (a driver would run a control transfer
    // built from `Setup::clear_feature_halt`) unblocks the pipe; the
    // frameless transfer then completes immediately.
    bus.clear_stall(pipe);
    let events = wait_events(&root, 1);
    assert_eq!(events, vec![(ids[0], Ok(0))]);
    assert!(!bus.pipe_stalled(pipe));
}

#[test]
fn timeout_fires_and_cancels() {
    let bus = UsbBus::new(BusConfig::default());
    let hc = MockHc::new(Mode::Record, true);
    let pipe = bulk_pipe(&bus, &hc, Direction::Out);

    let driver = TestDriver {
        req_len: 64,
        ..TestDriver::default()
    };
    let (root, ids) = transfer_setup(
        &bus,
        &[pipe],
        &[bulk_config(64, XferFlags::default(), 20)],
        driver,
    )
    .unwrap();

    root.lock().start(ids[0]);
    let events = wait_events(&root, 1);
    assert_eq!(events, vec![(ids[0], Err(UsbError::Timeout))]);
    assert_eq!(hc.closed.lock().unwrap().clone(), vec![ids[0]]);
}

#[test]
fn dma_delay_postpones_cancel_callback() {
    let bus = UsbBus::new(BusConfig { dma_delay_ms: 30 });
    let hc = MockHc::new(Mode::Record, true);
    let pipe = bulk_pipe(&bus, &hc, Direction::Out);

    let driver = TestDriver {
        req_len: 64,
        ..TestDriver::default()
    };
    let (root, ids) = transfer_setup(
        &bus,
        &[pipe],
        &[bulk_config(64, XferFlags::default(), 0)],
        driver,
    )
    .unwrap();
    let id = ids[0];

    root.lock().start(id);
    let begin = Instant::now();
    {
        let mut guard = root.lock();
        guard.stop(id);
        // Completion held back by the DMA synchronization window.
        assert!(guard.events.is_empty());
        assert!(guard.pending(id));
        guard.drain(id);
        assert!(!guard.pending(id));
    }
    assert!(begin.elapsed() >= Duration::from_millis(30));
    let events = wait_events(&root, 1);
    assert_eq!(events, vec![(id, Err(UsbError::Cancelled))]);
}

#[test]
fn dma_load_stage_feeds_the_pipe() {
    let bus = UsbBus::new(BusConfig::default());
    let hc = MockHc::with_dma(Mode::Complete);
    let pipe = bulk_pipe(&bus, &hc, Direction::Out);

    let driver = TestDriver {
        req_len: 256,
        payload: Some(vec![1; 256]),
        ..TestDriver::default()
    };
    let (root, ids) = transfer_setup(
        &bus,
        &[pipe],
        &[bulk_config(256, XferFlags::default(), 0)],
        driver,
    )
    .unwrap();

    root.lock().start(ids[0]);
    let events = wait_events(&root, 1);
    assert_eq!(events, vec![(ids[0], Ok(256))]);
}

#[test]
fn pipe_bof_freezes_queue_until_restart() {
    let bus = UsbBus::new(BusConfig::default());
    let hc = MockHc::new(Mode::Record, true);
    let pipe = bulk_pipe(&bus, &hc, Direction::Out);

    let driver = TestDriver {
        req_len: 64,
        ..TestDriver::default()
    };
    let (root, ids) = transfer_setup(
        &bus,
        &[pipe],
        &[
            bulk_config(64, XferFlags::PIPE_BOF, 0),
            bulk_config(64, XferFlags::default(), 0),
        ],
        driver,
    )
    .unwrap();
    let (a, b) = (ids[0], ids[1]);

    {
        let mut guard = root.lock();
        guard.start(a);
        guard.start(b);
    }
    assert_eq!(hc.started_ids(), vec![a]);

    bus.hw_access(a, |hw| hw.done(Some(UsbError::Stalled)));
    let events = wait_events(&root, 1);
    assert_eq!(events, vec![(a, Err(UsbError::Stalled))]);

    // The failure froze the pipe: the queued transfer must not start.
    thread::sleep(Duration::from_millis(20));
    assert_eq!(hc.started_ids(), vec![a]);

    // Restarting the failed transfer thaws the queue in FIFO order.
    root.lock().start(a);
    assert_eq!(hc.started_ids(), vec![a, a]);
    bus.hw_access(a, |hw| {
        hw.set_act_len(0, 64);
        hw.done(None);
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while hc.started_ids().len() < 3 {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(hc.started_ids(), vec![a, a, b]);
}

#[test]
fn frame_length_sum_overflow_is_reported() {
    let bus = UsbBus::new(BusConfig::default());
    let hc = MockHc::new(Mode::Record, true);
    let pipe = bulk_pipe(&bus, &hc, Direction::Out);

    let driver = TestDriver::default();
    let configs = [TransferConfig {
        ty: EndpointTy::Bulk,
        endpoint: EndpointAddr::Any,
        direction: DirSpec::Any,
        bufsize: 64,
        frames: 2,
        flags: XferFlags::default(),
        timeout_ms: 0,
        interval_ms: 0,
        callback: overflow_cb,
    }];
    let (root, ids) = transfer_setup(&bus, &[pipe], &configs, driver).unwrap();

    {
        let mut guard = root.lock();
        guard.start(ids[0]);
        // Rejected before the hardware ever saw it.
        assert_eq!(guard.events, vec![(ids[0], Err(UsbError::Overflow))]);
    }
    assert!(hc.started_ids().is_empty());
}

#[test]
fn actual_never_exceeds_requested() {
    let bus = UsbBus::new(BusConfig::default());
    let hc = MockHc::new(Mode::Complete, true);
    let pipe = bulk_pipe(&bus, &hc, Direction::In);

    let driver = TestDriver {
        req_len: 333,
        ..TestDriver::default()
    };
    let (root, ids) = transfer_setup(
        &bus,
        &[pipe],
        &[bulk_config(512, XferFlags::default(), 0)],
        driver,
    )
    .unwrap();

    root.lock().start(ids[0]);
    let events = wait_events(&root, 1);
    let (_, outcome) = events[0];
    assert_eq!(outcome, Ok(333));
}

#[test]
fn interval_delays_submission() {
    let bus = UsbBus::new(BusConfig::default());
    let hc = MockHc::new(Mode::Complete, true);
    let pipe = bulk_pipe(&bus, &hc, Direction::Out);

    let driver = TestDriver {
        req_len: 8,
        ..TestDriver::default()
    };
    let configs = [TransferConfig {
        ty: EndpointTy::Bulk,
        endpoint: EndpointAddr::Any,
        direction: DirSpec::Any,
        bufsize: 8,
        frames: 1,
        flags: XferFlags::default(),
        timeout_ms: 0,
        interval_ms: 25,
        callback: bulk_cb,
    }];
    let (root, ids) = transfer_setup(&bus, &[pipe], &configs, driver).unwrap();

    let begin = Instant::now();
    root.lock().start(ids[0]);
    // Not yet with the hardware: the pre-start delay is running.
    assert!(hc.started_ids().is_empty());

    let events = wait_events(&root, 1);
    assert!(begin.elapsed() >= Duration::from_millis(25));
    assert_eq!(events, vec![(ids[0], Ok(8))]);
}
