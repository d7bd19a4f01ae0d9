//! End-to-end driver scenarios (§8): a synthetic host (`lgmp::testutil::SyntheticHost`)
//! plays the hypervisor side of the region while `lg_client::run` drives the
//! real three-task scheduler against it in a scoped thread. No mocks below
//! the wire format — these exercise the actual `Transport`/`Queue` parsing
//! this crate ships.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};

use lgmp::testutil::SyntheticHost;
use lgmp::wire::{CursorFlags, CURSOR_DESCRIPTOR_WIRE_SIZE, FEATURE_SET_CURSOR_POS, FRAME_DESCRIPTOR_WIRE_SIZE, VERSION};

use lg_client::config::PollingConfig;
use lg_client::sink::{Cap, CursorSink, DisplaySink, FrameFormat, FramePayload, FrameSink};
use lg_client::state::{new_shared_state, SessionPhase};
use lg_client::DriverHandles;

fn fast_polling() -> PollingConfig {
    PollingConfig {
        session_retry_ms: 5,
        queue_empty_sleep_ms: 2,
        heartbeat_check_ms: 10,
    }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    loop {
        if cond() {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

#[derive(Debug, Clone, PartialEq)]
enum FrameEvent {
    Format(FrameFormat),
    Frame { bytes: usize, damage_rects: usize },
    Restart,
}

struct FrameRecorder {
    events: Arc<Mutex<Vec<FrameEvent>>>,
    dma: bool,
}

impl FrameSink for FrameRecorder {
    fn on_format(&mut self, format: FrameFormat) {
        self.events.lock().unwrap().push(FrameEvent::Format(format));
    }
    fn on_frame(&mut self, payload: FramePayload<'_>, damage_rects: &[lgmp::wire::DamageRect]) {
        let bytes = match payload {
            FramePayload::Bytes(b) => b.len(),
            FramePayload::DmaBuf(_) => 0,
        };
        self.events.lock().unwrap().push(FrameEvent::Frame { bytes, damage_rects: damage_rects.len() });
    }
    fn on_restart(&mut self) {
        self.events.lock().unwrap().push(FrameEvent::Restart);
    }
    fn supports(&self, cap: Cap) -> bool {
        matches!(cap, Cap::Dmabuf) && self.dma
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CursorEvent {
    Shape { width: u32, height: u32 },
    State { visible: bool, x: i16, y: i16 },
}

struct CursorRecorder {
    events: Arc<Mutex<Vec<CursorEvent>>>,
}

impl CursorSink for CursorRecorder {
    fn on_cursor_shape(&mut self, _t: lgmp::wire::CursorType, width: u32, height: u32, _p: u32, _b: &[u8]) {
        self.events.lock().unwrap().push(CursorEvent::Shape { width, height });
    }
    fn on_cursor_state(&mut self, visible: bool, x: i16, y: i16, _hx: i8, _hy: i8) {
        self.events.lock().unwrap().push(CursorEvent::State { visible, x, y });
    }
}

#[derive(Default)]
struct DisplayRecorder {
    guest_updates: Mutex<usize>,
    activations: Mutex<usize>,
}

impl DisplaySink for DisplayRecorder {
    fn request_activation(&self) {
        *self.activations.lock().unwrap() += 1;
    }
    fn inhibit_idle(&self, _inhibit: bool) {}
    fn guest_pointer_updated(&self, _gx: i16, _gy: i16, _lx: i16, _ly: i16) {
        *self.guest_updates.lock().unwrap() += 1;
    }
}

fn make_frame_payload(serial: u32, format_ver: u32, frame_type: u32, width: u32, height: u32, pitch: u32) -> Vec<u8> {
    let pixel_offset = FRAME_DESCRIPTOR_WIRE_SIZE as u32;
    let pixel_size = height * pitch;
    let mut buf = vec![0u8; (pixel_offset + pixel_size) as usize];
    LittleEndian::write_u32(&mut buf[0..4], format_ver);
    LittleEndian::write_u32(&mut buf[4..8], serial);
    LittleEndian::write_u32(&mut buf[8..12], frame_type);
    LittleEndian::write_u32(&mut buf[12..16], width);
    LittleEndian::write_u32(&mut buf[16..20], height);
    LittleEndian::write_u32(&mut buf[20..24], width);
    LittleEndian::write_u32(&mut buf[24..28], height);
    LittleEndian::write_u32(&mut buf[28..32], 0); // rotation
    LittleEndian::write_u32(&mut buf[32..36], pitch);
    LittleEndian::write_u32(&mut buf[36..40], pitch);
    LittleEndian::write_u32(&mut buf[40..44], pixel_offset);
    LittleEndian::write_u32(&mut buf[44..48], 0); // damageRectsCount
    let flags_off = FRAME_DESCRIPTOR_WIRE_SIZE - 4;
    LittleEndian::write_u32(&mut buf[flags_off..flags_off + 4], 0);
    buf
}

fn make_cursor_payload(x: i16, y: i16, shape: Option<&[u8]>, width: u32, height: u32, pitch: u32) -> Vec<u8> {
    let shape_len = shape.map_or(0, |s| s.len());
    let mut buf = vec![0u8; CURSOR_DESCRIPTOR_WIRE_SIZE + shape_len];
    LittleEndian::write_i16(&mut buf[0..2], x);
    LittleEndian::write_i16(&mut buf[2..4], y);
    LittleEndian::write_u32(&mut buf[4..8], 0); // COLOR
    buf[8] = 0;
    buf[9] = 0;
    // buf[10..12] is the KVMFRCursor struct's alignment padding.
    LittleEndian::write_u32(&mut buf[12..16], width);
    LittleEndian::write_u32(&mut buf[16..20], height);
    LittleEndian::write_u32(&mut buf[20..24], pitch);
    if let Some(s) = shape {
        buf[CURSOR_DESCRIPTOR_WIRE_SIZE..].copy_from_slice(s);
    }
    buf
}

struct Harness {
    frame_events: Arc<Mutex<Vec<FrameEvent>>>,
    cursor_events: Arc<Mutex<Vec<CursorEvent>>>,
    display: Arc<DisplayRecorder>,
}

/// Runs `lg_client::run` in a scoped thread against `host_setup`, handing the
/// test closure `(host, handles, harness)` to drive and assert against, then
/// requests shutdown and joins before returning `harness` for final checks.
fn drive(host_path: &std::path::Path, body: impl FnOnce(&mut SyntheticHost, &DriverHandles, &Harness)) -> Harness {
    let harness = Harness {
        frame_events: Arc::new(Mutex::new(Vec::new())),
        cursor_events: Arc::new(Mutex::new(Vec::new())),
        display: Arc::new(DisplayRecorder::default()),
    };

    let mut host = SyntheticHost::create(host_path).expect("create synthetic region");
    let shm_path = host.path().to_path_buf();
    let handles = DriverHandles::new(new_shared_state());
    let polling = fast_polling();

    let mut frame_sink = FrameRecorder { events: Arc::clone(&harness.frame_events), dma: false };
    let mut cursor_sink = CursorRecorder { events: Arc::clone(&harness.cursor_events) };
    let display: &DisplayRecorder = harness.display.as_ref();

    thread::scope(|scope| {
        let join = scope.spawn(|| {
            lg_client::run(&shm_path, &polling, &handles, &mut frame_sink, &mut cursor_sink, display)
        });

        body(&mut host, &handles, &harness);

        handles.request_shutdown();
        let result = join.join().expect("driver thread panicked");
        result.expect("driver returned an error");
    });

    harness
}

#[test]
fn startup_with_no_host_present_stays_connecting() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("region");

    let harness = drive(&path, |_host, handles, _h| {
        thread::sleep(Duration::from_millis(120));
        assert_eq!(handles.state().lock().unwrap().phase, SessionPhase::Connecting);
    });

    assert!(harness.frame_events.lock().unwrap().is_empty());
    assert!(harness.cursor_events.lock().unwrap().is_empty());
}

#[test]
fn incompatible_host_version_is_ignored_until_upgraded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("region");

    let harness = drive(&path, |host, handles, _h| {
        host.write_header(VERSION - 1, "old-host", 0);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(handles.state().lock().unwrap().phase, SessionPhase::Connecting);

        host.write_header(VERSION, "new-host", FEATURE_SET_CURSOR_POS);
        host.open_session(1, 1);

        let reached = wait_until(Duration::from_secs(2), || {
            handles.state().lock().unwrap().phase == SessionPhase::Running
        });
        assert!(reached, "driver never reached Running after host came up at the right version");
    });

    assert!(harness.frame_events.lock().unwrap().is_empty());
}

#[test]
fn single_frame_delivery_emits_format_then_frame() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("region");

    let harness = drive(&path, |host, handles, h| {
        host.write_header(VERSION, "host-1.0", FEATURE_SET_CURSOR_POS);
        host.open_session(1, 1);

        let reached = wait_until(Duration::from_secs(2), || {
            handles.state().lock().unwrap().phase == SessionPhase::Running
        });
        assert!(reached, "session never came up");

        host.publish_frame(&make_frame_payload(1, 1, 0, 1920, 1080, 7680));

        let delivered = wait_until(Duration::from_secs(2), || h.frame_events.lock().unwrap().len() >= 2);
        assert!(delivered, "frame was never delivered");
    });

    let events = harness.frame_events.lock().unwrap();
    assert_eq!(events.len(), 2);
    match &events[0] {
        FrameEvent::Format(fmt) => {
            assert_eq!(fmt.format_ver, 1);
            assert_eq!(fmt.width, 1920);
            assert_eq!(fmt.height, 1080);
            assert_eq!(fmt.bpp, 32);
            assert_eq!(fmt.pitch, 7680);
        }
        other => panic!("expected Format first, got {other:?}"),
    }
    match &events[1] {
        FrameEvent::Frame { bytes, damage_rects } => {
            assert_eq!(*bytes, 1080 * 7680);
            assert_eq!(*damage_rects, 0);
        }
        other => panic!("expected Frame second, got {other:?}"),
    }
}

#[test]
fn format_change_mid_stream_emits_a_second_format() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("region");

    let harness = drive(&path, |host, handles, h| {
        host.write_header(VERSION, "host-1.0", FEATURE_SET_CURSOR_POS);
        host.open_session(1, 1);
        assert!(wait_until(Duration::from_secs(2), || {
            handles.state().lock().unwrap().phase == SessionPhase::Running
        }));

        host.publish_frame(&make_frame_payload(1, 1, 0, 1920, 1080, 7680));
        assert!(wait_until(Duration::from_secs(2), || h.frame_events.lock().unwrap().len() >= 2));

        // RGBA10, a new format version and a new resolution.
        host.publish_frame(&make_frame_payload(2, 2, 2, 2560, 1440, 10240));
        assert!(wait_until(Duration::from_secs(2), || h.frame_events.lock().unwrap().len() >= 4));
    });

    let events = harness.frame_events.lock().unwrap();
    assert_eq!(events.len(), 4);
    assert!(matches!(&events[0], FrameEvent::Format(f) if f.format_ver == 1 && f.width == 1920));
    assert!(matches!(&events[1], FrameEvent::Frame { bytes, .. } if *bytes == 1080 * 7680));
    assert!(matches!(&events[2], FrameEvent::Format(f) if f.format_ver == 2 && f.width == 2560));
    assert!(matches!(&events[3], FrameEvent::Frame { bytes, .. } if *bytes == 1440 * 10240));
}

#[test]
fn cursor_shape_then_move_delivers_both_updates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("region");

    let harness = drive(&path, |host, handles, h| {
        host.write_header(VERSION, "host-1.0", FEATURE_SET_CURSOR_POS);
        host.open_session(1, 1);
        assert!(wait_until(Duration::from_secs(2), || {
            handles.state().lock().unwrap().phase == SessionPhase::Running
        }));

        let shape = vec![0xffu8; 32 * 32 * 4];
        let tag = CursorFlags::SHAPE | CursorFlags::POSITION | CursorFlags::VISIBLE;
        host.publish_cursor(&make_cursor_payload(100, 100, Some(&shape), 32, 32, 32 * 4), tag);

        assert!(wait_until(Duration::from_secs(2), || h.cursor_events.lock().unwrap().len() >= 2));

        host.publish_cursor(&make_cursor_payload(110, 100, None, 32, 32, 32 * 4), CursorFlags::POSITION);

        assert!(wait_until(Duration::from_secs(2), || h.cursor_events.lock().unwrap().len() >= 3));
    });

    let events = harness.cursor_events.lock().unwrap();
    assert_eq!(events[0], CursorEvent::Shape { width: 32, height: 32 });
    assert_eq!(events[1], CursorEvent::State { visible: true, x: 100, y: 100 });
    assert_eq!(*events.last().unwrap(), CursorEvent::State { visible: true, x: 110, y: 100 });
    assert_eq!(*harness.display.guest_updates.lock().unwrap(), 1);
}

#[test]
fn set_cursor_pos_round_trip_writes_the_outbound_ring() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("region");

    drive(&path, |host, handles, _h| {
        host.write_header(VERSION, "host-1.0", FEATURE_SET_CURSOR_POS);
        host.open_session(1, 1);
        assert!(wait_until(Duration::from_secs(2), || {
            handles.state().lock().unwrap().phase == SessionPhase::Running
        }));

        // `Running` flips just before the cursor task's request channel is
        // installed, so the very first attempt can briefly race "no active
        // session" on a freshly started session; retry past that window.
        let mut attempt = None;
        assert!(wait_until(Duration::from_secs(2), || {
            match handles.request_set_cursor_pos(42, 7, Duration::from_millis(200)) {
                Ok(serial) => {
                    attempt = Some(serial);
                    true
                }
                Err(_) => false,
            }
        }));
        let serial = attempt.expect("request_set_cursor_pos eventually accepted");
        assert_eq!(serial, 1, "no pointer message has been published yet, so the target serial is 1");

        let (msg_type, x, y) = host.read_pointer_out_slot(0);
        assert_eq!(msg_type, 0, "MESSAGE_SET_CURSOR_POS");
        assert_eq!((x, y), (42, 7));
    });
}

#[test]
fn host_restart_mid_stream_triggers_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("region");

    let harness = drive(&path, |host, handles, h| {
        host.write_header(VERSION, "host-1.0", FEATURE_SET_CURSOR_POS);
        host.open_session(1, 1);
        assert!(wait_until(Duration::from_secs(2), || {
            handles.state().lock().unwrap().phase == SessionPhase::Running
        }));

        host.publish_frame(&make_frame_payload(1, 1, 0, 1920, 1080, 7680));
        assert!(wait_until(Duration::from_secs(2), || h.frame_events.lock().unwrap().len() >= 2));

        host.kill();
        assert!(wait_until(Duration::from_secs(2), || {
            handles.state().lock().unwrap().phase == SessionPhase::Restarting
        }));

        // `kill()` zeroes the magic along with the session id; a real host
        // coming back up republishes the whole header, not just the session.
        host.write_header(VERSION, "host-1.0", FEATURE_SET_CURSOR_POS);
        host.open_session(2, 1);
        host.publish_frame(&make_frame_payload(1, 1, 0, 1920, 1080, 7680));

        assert!(wait_until(Duration::from_secs(2), || {
            h.frame_events.lock().unwrap().iter().any(|e| *e == FrameEvent::Restart)
        }));
        assert!(wait_until(Duration::from_secs(2), || h.frame_events.lock().unwrap().len() >= 5));
    });

    let events = harness.frame_events.lock().unwrap();
    let restart_pos = events.iter().position(|e| *e == FrameEvent::Restart).expect("on_restart fired");
    assert!(matches!(&events[restart_pos + 1], FrameEvent::Format(f) if f.format_ver == 1));
    assert!(matches!(&events[restart_pos + 2], FrameEvent::Frame { .. }));
}
