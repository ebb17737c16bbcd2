// SPDX-License-Identifier: GPL-3.0-only

//! Still-picture assembly on a single-flight worker thread
//!
//! The capture loop hands a [`PictureJob`] over the moment an armed still
//! completes; everything slow happens here so the loop keeps pacing the
//! sensor. A job reuses the sensor's own JPEG when the transfer carried
//! one and encodes the YUV scanlines otherwise, splices the EXIF segment
//! behind the start marker, and delivers exactly one shutter notification
//! plus one compressed image on success, or exactly one error
//! notification on failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::capture::PipelineCore;
use crate::errors::{HalError, HalResult};
use crate::hw::{EncodeRequest, ExifComposer, ExifRequest, FrameAllocator, ImageCompressor};
use crate::sink::{DataKind, NotifyKind, SinkDispatcher};
use crate::types::{BufferDescriptor, Geometry, GpsFix, PartialExif, PixelFormat};

const SOI: [u8; 2] = [0xff, 0xd8];

/// Snapshot of everything one still needs, detached from the loop state
#[derive(Debug, Clone)]
pub struct PictureJob {
    /// Pixel source for software encode and for the thumbnail
    pub yuv: Option<Vec<u8>>,
    pub yuv_geometry: Geometry,
    pub yuv_format: PixelFormat,
    /// Sensor-produced JPEG body, reused verbatim when present
    pub jpeg: Option<Vec<u8>>,
    pub picture_geometry: Geometry,
    pub jpeg_quality: u8,
    /// Zero geometry means no embedded thumbnail
    pub thumbnail_geometry: Geometry,
    pub thumbnail_quality: u8,
    pub exif: PartialExif,
    /// Location fix latched from the parameter table, when one is set
    pub gps: Option<GpsFix>,
    pub maker: &'static str,
    pub model: &'static str,
    pub orientation: i32,
}

/// Runs picture jobs one at a time on a detached thread
///
/// A second submission while one is in flight is dropped; the client
/// already has a still coming.
pub struct PictureExecutor {
    running: Arc<AtomicBool>,
    dispatcher: SinkDispatcher,
    compressor: Mutex<Box<dyn ImageCompressor>>,
    composer: Mutex<Box<dyn ExifComposer>>,
    allocator: Mutex<Box<dyn FrameAllocator>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PictureExecutor {
    pub fn new(
        dispatcher: SinkDispatcher,
        compressor: Box<dyn ImageCompressor>,
        composer: Box<dyn ExifComposer>,
        allocator: Box<dyn FrameAllocator>,
    ) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            dispatcher,
            compressor: Mutex::new(compressor),
            composer: Mutex::new(composer),
            allocator: Mutex::new(allocator),
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the job unless one is already in flight
    ///
    /// `core` is only touched at completion, to clear the armed flag and
    /// release the AE/AWB lock exactly once per still.
    pub fn submit(self: &Arc<Self>, job: PictureJob, core: Arc<Mutex<PipelineCore>>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("picture already in flight, dropping the trigger");
            return false;
        }

        let this = Arc::clone(self);
        let spawned = thread::Builder::new().name("picture".into()).spawn(move || {
            let started = Instant::now();
            match this.assemble(&job) {
                Ok(picture) => {
                    info!(
                        bytes = picture.len(),
                        geometry = %job.picture_geometry,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "still assembled"
                    );
                    this.dispatcher.notify(NotifyKind::Shutter, 0, 0);
                    let descriptor = BufferDescriptor::bytes(
                        Arc::from(picture.into_boxed_slice()),
                        0,
                        job.picture_geometry,
                        PixelFormat::Jpeg,
                    );
                    this.dispatcher.data(DataKind::CompressedImage, &descriptor);
                }
                Err(err) => {
                    error!(%err, "still assembly failed");
                    this.dispatcher.notify(NotifyKind::Error, 0, 0);
                }
            }
            {
                let mut core = core.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                core.finish_picture();
            }
            this.running.store(false, Ordering::SeqCst);
        });

        match spawned {
            Ok(handle) => {
                let mut slot = self.handle_slot();
                // The previous thread is long done; reap it
                if let Some(old) = slot.replace(handle) {
                    let _ = old.join();
                }
                true
            }
            Err(err) => {
                error!(%err, "could not spawn the picture thread");
                self.dispatcher.notify(NotifyKind::Error, 0, 0);
                self.running.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Block until the in-flight job finished, bounded
    pub fn wait_idle(&self, bound: Duration) -> bool {
        let deadline = Instant::now() + bound;
        while self.is_running() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        if let Some(handle) = self.handle_slot().take() {
            let _ = handle.join();
        }
        true
    }

    fn handle_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn assemble(&self, job: &PictureJob) -> HalResult<Vec<u8>> {
        let body = match &job.jpeg {
            Some(jpeg) => jpeg.clone(),
            None => {
                let yuv = job
                    .yuv
                    .as_ref()
                    .ok_or_else(|| HalError::Other("still without any pixel source".into()))?;
                let mut out = Vec::new();
                self.compressor
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .encode(
                        &EncodeRequest {
                            source: job.yuv_geometry,
                            source_format: job.yuv_format,
                            target: job.picture_geometry,
                            quality: job.jpeg_quality,
                        },
                        yuv,
                        &mut out,
                    )?;
                out
            }
        };
        if body.len() < SOI.len() || body[..2] != SOI {
            return Err(HalError::Other("picture body lacks the start marker".into()));
        }

        let thumbnail = match (&job.yuv, job.thumbnail_geometry.is_zero()) {
            (Some(yuv), false) => {
                let mut out = Vec::new();
                self.compressor
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .encode(
                        &EncodeRequest {
                            source: job.yuv_geometry,
                            source_format: job.yuv_format,
                            target: job.thumbnail_geometry,
                            quality: job.thumbnail_quality,
                        },
                        yuv,
                        &mut out,
                    )?;
                Some(out)
            }
            _ => None,
        };

        let exif = self
            .composer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .compose(&ExifRequest {
                geometry: job.picture_geometry,
                exif: &job.exif,
                gps: job.gps,
                thumbnail: thumbnail.as_deref(),
                maker: job.maker,
                model: job.model,
                orientation: job.orientation,
            })?;

        // Final layout: start marker, EXIF APP1 segment, body minus its
        // own start marker
        let total = SOI.len() + exif.len() + (body.len() - SOI.len());
        let mut memory = self
            .allocator
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .allocate(total, 1)?;
        let out = memory.chunk_mut(0);
        out[..SOI.len()].copy_from_slice(&SOI);
        out[SOI.len()..SOI.len() + exif.len()].copy_from_slice(&exif);
        out[SOI.len() + exif.len()..].copy_from_slice(&body[SOI.len()..]);
        Ok(memory.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureTuning, PipelineCore};
    use crate::exif::SoftwareExif;
    use crate::hw::HeapAllocator;
    use crate::hw::mock::{FailingAllocator, MockCaptureDevice};
    use crate::media::{SoftwareCompressor, SoftwareScaler};
    use crate::profile;
    use crate::sink::{CallbackGate, CameraSink, RecordingSink};
    use crate::types::MessageKind;
    use std::sync::atomic::AtomicU32;

    fn dispatcher(sink: Arc<RecordingSink>) -> SinkDispatcher {
        SinkDispatcher::new(
            sink as Arc<dyn CameraSink>,
            Arc::new(AtomicU32::new(MessageKind::ALL.0)),
            CallbackGate::new(),
        )
    }

    fn test_core(dispatcher: SinkDispatcher) -> Arc<Mutex<PipelineCore>> {
        Arc::new(Mutex::new(
            PipelineCore::new(
                profile::by_name("s5c73m3").unwrap(),
                Box::new(MockCaptureDevice::new()),
                Box::new(SoftwareScaler::new()),
                Box::new(SoftwareScaler::new()),
                dispatcher,
                CaptureTuning::default(),
            )
            .unwrap(),
        ))
    }

    /// Small grey YUYV source
    fn yuv_job() -> PictureJob {
        PictureJob {
            yuv: Some(vec![0x80; 32 * 16 * 2]),
            yuv_geometry: Geometry::new(32, 16),
            yuv_format: PixelFormat::Yuyv,
            jpeg: None,
            picture_geometry: Geometry::new(32, 16),
            jpeg_quality: 90,
            thumbnail_geometry: Geometry::new(16, 8),
            thumbnail_quality: 100,
            exif: PartialExif::default(),
            gps: None,
            maker: "SAMSUNG",
            model: "S5C73M3",
            orientation: 90,
        }
    }

    fn executor(sink: Arc<RecordingSink>) -> Arc<PictureExecutor> {
        Arc::new(PictureExecutor::new(
            dispatcher(sink),
            Box::new(SoftwareCompressor),
            Box::new(SoftwareExif::new()),
            Box::new(HeapAllocator),
        ))
    }

    #[test]
    fn success_delivers_one_shutter_and_one_image() {
        let sink = Arc::new(RecordingSink::new());
        let executor = executor(Arc::clone(&sink));
        let core = test_core(dispatcher(Arc::new(RecordingSink::new())));

        assert!(executor.submit(yuv_job(), Arc::clone(&core)));
        assert!(executor.wait_idle(Duration::from_secs(10)));

        assert_eq!(sink.notify_count(NotifyKind::Shutter), 1);
        assert_eq!(sink.data_count(DataKind::CompressedImage), 1);
        assert_eq!(sink.notify_count(NotifyKind::Error), 0);
    }

    #[test]
    fn assembled_still_is_soi_exif_body() {
        let sink = Arc::new(RecordingSink::new());
        let executor = executor(Arc::clone(&sink));

        let picture = executor.assemble(&yuv_job()).unwrap();
        assert_eq!(&picture[..2], &SOI);
        // APP1 marker right behind the start marker
        assert_eq!(&picture[2..4], &[0xff, 0xe1]);
        assert_eq!(&picture[picture.len() - 2..], &[0xff, 0xd9]);
    }

    #[test]
    fn sensor_jpeg_is_reused_not_reencoded() {
        let sink = Arc::new(RecordingSink::new());
        let executor = executor(Arc::clone(&sink));

        let mut job = yuv_job();
        job.thumbnail_geometry = Geometry::new(0, 0);
        job.jpeg = Some(vec![0xff, 0xd8, 0xaa, 0xbb, 0xcc, 0xff, 0xd9]);
        let picture = executor.assemble(&job).unwrap();
        // The sensor body tail survives byte for byte behind the segment
        assert!(picture.ends_with(&[0xaa, 0xbb, 0xcc, 0xff, 0xd9]));
    }

    #[test]
    fn sensor_body_without_marker_is_refused() {
        let sink = Arc::new(RecordingSink::new());
        let executor = executor(Arc::clone(&sink));

        let mut job = yuv_job();
        job.jpeg = Some(vec![0x00, 0x11, 0x22]);
        assert!(executor.assemble(&job).is_err());
    }

    #[test]
    fn allocation_failure_is_one_error_notification() {
        let sink = Arc::new(RecordingSink::new());
        let executor = Arc::new(PictureExecutor::new(
            dispatcher(Arc::clone(&sink)),
            Box::new(SoftwareCompressor),
            Box::new(SoftwareExif::new()),
            Box::new(FailingAllocator::fail_after(0)),
        ));
        let core = test_core(dispatcher(Arc::new(RecordingSink::new())));

        assert!(executor.submit(yuv_job(), Arc::clone(&core)));
        assert!(executor.wait_idle(Duration::from_secs(10)));

        assert_eq!(sink.notify_count(NotifyKind::Error), 1);
        assert_eq!(sink.notify_count(NotifyKind::Shutter), 0);
        assert_eq!(sink.data_count(DataKind::CompressedImage), 0);
        // Ready for the next still
        assert!(!executor.is_running());
    }

    #[test]
    fn second_submission_in_flight_is_dropped() {
        let sink = Arc::new(RecordingSink::new());
        let executor = executor(Arc::clone(&sink));
        let core = test_core(dispatcher(Arc::new(RecordingSink::new())));

        // Force the busy flag by hand so the race is deterministic
        executor.running.store(true, Ordering::SeqCst);
        assert!(!executor.submit(yuv_job(), Arc::clone(&core)));
        executor.running.store(false, Ordering::SeqCst);

        assert!(executor.submit(yuv_job(), core));
        assert!(executor.wait_idle(Duration::from_secs(10)));
        assert_eq!(sink.data_count(DataKind::CompressedImage), 1);
    }
}
