//! On-demand person detection over the latest captured frame.
//!
//! The scheduler does no throttling of its own: callers poll `detect_current`
//! at most `DETECT_MAX_HZ`. Threshold and enable flag are atomics so they can
//! be changed from any thread and apply to the next call.

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::camera::FrameSource;
use crate::storage::BoundedStore;

use super::overlay;
use super::registry::SharedDetector;
use super::result::{DetectOutcome, Detection, DetectionReport, ObjectClass};

pub struct DetectionScheduler {
    source: Arc<FrameSource>,
    detector: SharedDetector,
    store: Arc<BoundedStore>,
    threshold_bits: AtomicU32,
    enabled: AtomicBool,
}

impl DetectionScheduler {
    pub fn new(
        source: Arc<FrameSource>,
        detector: SharedDetector,
        store: Arc<BoundedStore>,
    ) -> Self {
        Self {
            source,
            detector,
            store,
            threshold_bits: AtomicU32::new(0.5f32.to_bits()),
            enabled: AtomicBool::new(true),
        }
    }

    /// Clamped to [0, 1]. Non-finite values are ignored.
    pub fn set_confidence_threshold(&self, threshold: f32) {
        if !threshold.is_finite() {
            log::warn!("ignoring non-finite confidence threshold {}", threshold);
            return;
        }
        self.threshold_bits
            .store(threshold.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn confidence_threshold(&self) -> f32 {
        f32::from_bits(self.threshold_bits.load(Ordering::Relaxed))
    }

    pub fn set_detector_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn detector_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Load the detector model. On failure detection is switched off and the
    /// error is returned; capture is unaffected.
    pub fn load_model(&self) -> Result<()> {
        let result = {
            let mut detector = self
                .detector
                .lock()
                .map_err(|_| anyhow!("detector lock poisoned"))?;
            let name = detector.name();
            detector
                .load_model()
                .with_context(|| format!("load {} detector model", name))
        };
        if let Err(err) = &result {
            log::error!("detection disabled: {:#}", err);
            self.set_detector_enabled(false);
        }
        result
    }

    /// Run one detection pass over the latest frame and record the count.
    ///
    /// Returns `NoFrame` without invoking the detector when nothing has been
    /// captured. Detector failures are returned as errors and nothing is stored.
    pub fn detect_current(&self) -> Result<DetectOutcome> {
        if !self.detector_enabled() {
            return Ok(DetectOutcome::Disabled);
        }
        let Some(frame) = self.source.read() else {
            return Ok(DetectOutcome::NoFrame);
        };

        let threshold = self.confidence_threshold();
        let detections = {
            let mut detector = self
                .detector
                .lock()
                .map_err(|_| anyhow!("detector lock poisoned"))?;
            detector.set_confidence_threshold(threshold);
            let name = detector.name();
            detector
                .detect(frame.pixels(), frame.width, frame.height)
                .with_context(|| format!("{} detector failed", name))?
        };

        let people: Vec<Detection> = detections
            .into_iter()
            .filter(|d| d.class == ObjectClass::Person && d.confidence >= threshold)
            .collect();
        let count = people.len() as u32;
        let avg_confidence = if people.is_empty() {
            0.0
        } else {
            people.iter().map(|d| d.confidence).sum::<f32>() / people.len() as f32
        };

        let annotated = overlay::annotate(&frame, &people)?;
        let stored = self.store.store_detection(count, avg_confidence);
        Ok(DetectOutcome::Detected(DetectionReport {
            count,
            avg_confidence,
            detections: people,
            annotated,
            stored,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::StubBackend;
    use crate::detect::backend::DetectorBackend;
    use crate::frame::Resolution;
    use crate::ingest::{CameraConfig, SourceKind};
    use std::sync::Mutex;
    use std::time::Duration;

    fn running_source() -> Result<Arc<FrameSource>> {
        let source = Arc::new(FrameSource::new(CameraConfig {
            source: SourceKind::NetworkStream("stub://pattern?fps=100".to_string()),
            resolution: Resolution::new(64, 48),
        }));
        source.start()?;
        crate::camera::wait_for_frame(&source, Duration::from_secs(2), |_| true)?;
        Ok(source)
    }

    fn idle_source() -> Arc<FrameSource> {
        Arc::new(FrameSource::new(CameraConfig {
            source: SourceKind::NetworkStream("stub://pattern".to_string()),
            resolution: Resolution::new(64, 48),
        }))
    }

    type Harness = (DetectionScheduler, Arc<Mutex<StubBackend>>, Arc<BoundedStore>);

    fn build(source: Arc<FrameSource>, mut stub: StubBackend) -> Result<Harness> {
        // `without_model` stubs stay unloaded; their test loads through the scheduler.
        let _ = stub.load_model();
        build_unloaded(source, stub)
    }

    fn build_unloaded(source: Arc<FrameSource>, stub: StubBackend) -> Result<Harness> {
        let stub = Arc::new(Mutex::new(stub));
        let store = Arc::new(BoundedStore::open_in_memory()?);
        let detector: SharedDetector = stub.clone();
        let scheduler = DetectionScheduler::new(source, detector, Arc::clone(&store));
        Ok((scheduler, stub, store))
    }

    #[test]
    fn no_frame_skips_the_detector() -> Result<()> {
        let (scheduler, stub, store) = build(idle_source(), StubBackend::new())?;
        assert!(matches!(scheduler.detect_current()?, DetectOutcome::NoFrame));
        assert_eq!(stub.lock().map_err(|_| anyhow!("poisoned"))?.calls(), 0);
        assert!(store.get_latest_detection()?.is_none());
        Ok(())
    }

    #[test]
    fn keeps_confident_people_and_averages() -> Result<()> {
        let script = vec![vec![
            Detection::person(1.0, 1.0, 10.0, 10.0, 0.9),
            Detection::person(20.0, 5.0, 10.0, 10.0, 0.7),
            Detection::person(30.0, 5.0, 10.0, 10.0, 0.3),
            Detection {
                class: ObjectClass::Other(2),
                ..Detection::person(5.0, 20.0, 10.0, 10.0, 0.99)
            },
        ]];
        let (scheduler, stub, store) =
            build(running_source()?, StubBackend::with_script(script))?;
        scheduler.set_confidence_threshold(0.6);

        let DetectOutcome::Detected(report) = scheduler.detect_current()? else {
            return Err(anyhow!("expected a detection report"));
        };
        assert_eq!(report.count, 2);
        assert!((report.avg_confidence - 0.8).abs() < 1e-5);
        assert!(report.stored);
        assert_eq!(report.annotated.resolution(), Resolution::new(64, 48));
        assert_eq!(stub.lock().map_err(|_| anyhow!("poisoned"))?.threshold(), 0.6);

        let latest = store.get_latest_detection()?.ok_or_else(|| anyhow!("no row"))?;
        assert_eq!(latest.count, 2);
        Ok(())
    }

    #[test]
    fn empty_detection_stores_zero() -> Result<()> {
        let (scheduler, _stub, store) = build(running_source()?, StubBackend::new())?;
        let DetectOutcome::Detected(report) = scheduler.detect_current()? else {
            return Err(anyhow!("expected a detection report"));
        };
        assert_eq!(report.count, 0);
        assert_eq!(report.avg_confidence, 0.0);
        let latest = store.get_latest_detection()?.ok_or_else(|| anyhow!("no row"))?;
        assert_eq!((latest.count, latest.confidence), (0, 0.0));
        Ok(())
    }

    #[test]
    fn detector_failure_is_an_error_not_no_frame() -> Result<()> {
        let (scheduler, _stub, store) =
            build(running_source()?, StubBackend::failing("inference crashed"))?;
        let err = scheduler
            .detect_current()
            .err()
            .ok_or_else(|| anyhow!("expected failure"))?;
        assert!(format!("{:#}", err).contains("inference crashed"));
        assert!(store.get_latest_detection()?.is_none());
        Ok(())
    }

    #[test]
    fn unloaded_detector_is_an_error_not_no_frame() -> Result<()> {
        let (scheduler, _stub, store) = build_unloaded(running_source()?, StubBackend::new())?;
        let err = scheduler
            .detect_current()
            .err()
            .ok_or_else(|| anyhow!("expected failure"))?;
        assert!(format!("{:#}", err).contains("not loaded"));
        assert!(store.get_latest_detection()?.is_none());

        scheduler.load_model()?;
        assert!(matches!(scheduler.detect_current()?, DetectOutcome::Detected(_)));
        Ok(())
    }

    #[test]
    fn threshold_is_clamped_and_ignores_nan() -> Result<()> {
        let (scheduler, _stub, _store) = build(idle_source(), StubBackend::new())?;
        scheduler.set_confidence_threshold(0.3);
        scheduler.set_confidence_threshold(f32::NAN);
        assert_eq!(scheduler.confidence_threshold(), 0.3);
        scheduler.set_confidence_threshold(f32::INFINITY);
        assert_eq!(scheduler.confidence_threshold(), 0.3);
        scheduler.set_confidence_threshold(1.7);
        assert_eq!(scheduler.confidence_threshold(), 1.0);
        Ok(())
    }

    #[test]
    fn disabled_detection_does_nothing() -> Result<()> {
        let (scheduler, stub, _store) = build(running_source()?, StubBackend::new())?;
        scheduler.set_detector_enabled(false);
        assert!(matches!(scheduler.detect_current()?, DetectOutcome::Disabled));
        assert_eq!(stub.lock().map_err(|_| anyhow!("poisoned"))?.calls(), 0);
        Ok(())
    }

    #[test]
    fn model_load_failure_disables_detection() -> Result<()> {
        let (scheduler, _stub, _store) = build(idle_source(), StubBackend::without_model())?;
        assert!(scheduler.load_model().is_err());
        assert!(!scheduler.detector_enabled());
        Ok(())
    }
}
