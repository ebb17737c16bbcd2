// SPDX-License-Identifier: GPL-3.0-only

//! Front-sensor (managed ISP) pipeline tests
//!
//! The front sensor has no interleaved transfer: the whole buffer is a
//! plain UYVY frame, faces come from the driver instead of the metadata
//! block, and stills are always software-encoded.

use std::sync::Arc;
use std::time::{Duration, Instant};

use camhal::capture::CaptureTuning;
use camhal::exif::SoftwareExif;
use camhal::hw::mock::MockCaptureDevice;
use camhal::hw::{ControlId, HeapAllocator};
use camhal::media::{SoftwareCompressor, SoftwareScaler};
use camhal::profile;
use camhal::session::{CameraSession, Collaborators};
use camhal::sink::{CameraSink, DataKind, NotifyKind, RecordingSink, SinkEvent};
use camhal::types::{FaceRecord, PixelFormat, SinkPayload};

const DEADLINE: Duration = Duration::from_secs(5);

fn open_front(device: MockCaptureDevice) -> (CameraSession, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    let session = CameraSession::open(
        profile::by_name("s5k6a3").unwrap(),
        Collaborators {
            device: Box::new(device),
            allocator: Box::new(HeapAllocator),
            compressor: Box::new(SoftwareCompressor),
            composer: Box::new(SoftwareExif::new()),
            preview_path: Box::new(SoftwareScaler::new()),
            recording_path: Box::new(SoftwareScaler::new()),
        },
        Arc::clone(&sink) as Arc<dyn CameraSink>,
        CaptureTuning::default(),
    )
    .unwrap();
    session.set_parameters("preview-size=320x240").unwrap();
    (session, sink)
}

fn uyvy_frame() -> Vec<u8> {
    vec![0x80; 320 * 240 * 2]
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn preview_negotiates_the_wider_bus_window() {
    let device = MockCaptureDevice::new();
    let (session, sink) = open_front(device.clone());

    session.start_preview().unwrap();
    let config = device.current_config().unwrap();
    assert_eq!(config.format, PixelFormat::Uyvy);
    // The ISP wants the full sensor window for 320x240
    assert_eq!(config.mbus, Some(camhal::Geometry::new(1392, 1044)));
    // Face detection went to the firmware at stream start
    assert_eq!(device.last_control(ControlId::FaceDetectionCommand), Some(1));

    device.push_frame(uyvy_frame());
    assert!(wait_until(|| sink.data_count(DataKind::PreviewFrame) >= 1));
    session.close();
}

#[test]
fn driver_faces_flow_as_preview_metadata() {
    let device = MockCaptureDevice::new();
    device.set_faces(vec![FaceRecord {
        rect: [-200, -200, 200, 200],
        score: 70,
        id: 3,
    }]);
    let (session, sink) = open_front(device.clone());

    session.start_preview().unwrap();
    device.push_frame(uyvy_frame());
    assert!(wait_until(|| sink.data_count(DataKind::PreviewMetadata) >= 1));

    let faces = sink
        .events()
        .into_iter()
        .find_map(|event| match event {
            SinkEvent::Data { kind, buffer } if kind == DataKind::PreviewMetadata => Some(buffer),
            _ => None,
        })
        .unwrap();
    let SinkPayload::Faces(faces) = faces.payload else {
        panic!("metadata delivery should carry faces");
    };
    assert_eq!(faces.len(), 1);
    assert_eq!(faces[0].id, 3);
    session.close();
}

#[test]
fn still_is_software_encoded_from_the_stream() {
    let device = MockCaptureDevice::new();
    let (session, sink) = open_front(device.clone());
    // Keep the encode small
    session.set_parameters("picture-size=320x240").unwrap();

    session.start_preview().unwrap();
    session.take_picture().unwrap();
    device.push_frame(uyvy_frame());

    assert!(wait_until(|| sink.data_count(DataKind::CompressedImage) == 1));
    assert_eq!(sink.notify_count(NotifyKind::Shutter), 1);

    let still = sink
        .events()
        .into_iter()
        .find_map(|event| match event {
            SinkEvent::Data { kind, buffer } if kind == DataKind::CompressedImage => Some(buffer),
            _ => None,
        })
        .unwrap();
    let SinkPayload::Bytes(bytes) = &still.payload else {
        panic!("still should be bytes");
    };
    // Software encode still carries the spliced EXIF segment up front
    assert_eq!(&bytes[..4], &[0xff, 0xd8, 0xff, 0xe1]);
    session.close();
}

#[test]
fn fixed_focus_converges_immediately() {
    let device = MockCaptureDevice::new();
    let (session, sink) = open_front(device.clone());

    session.start_preview().unwrap();
    session.auto_focus().unwrap();
    // No status feed exists; the session answers for the lens itself
    assert_eq!(sink.notify_count(NotifyKind::Focus), 1);
    session.close();
}

#[test]
fn flash_and_zoom_groups_stay_unpublished() {
    let device = MockCaptureDevice::new();
    let (session, _sink) = open_front(device.clone());

    let flat = session.get_parameters();
    assert!(!flat.contains("flash-mode="));
    assert!(!flat.contains("zoom-ratios"));
    // Zoom writes never reach a sensor that cannot zoom
    session.set_parameters("zoom=5").unwrap_or_default();
    assert_eq!(device.last_control(ControlId::Zoom), None);
    session.close();
}
