//! Frame acquisition.
//!
//! `FrameSource` owns one capture device at a time and a dedicated acquisition
//! thread that keeps the shared `FrameBuffer` filled with the newest frame.
//!
//! Lifecycle:
//! - `start` opens the configured device on the caller's thread (so open
//!   failures are returned), then hands the device to the acquisition thread.
//! - `release` raises the stop flag, waits a bounded time for the thread to
//!   hand back control, and joins it. The thread releases the device itself.
//! - Reconfiguration (`set_source`, `set_resolution`) is a full
//!   release / update / start cycle that preserves the running state.
//!
//! Readers (`read`, `get_frame_encoded`, `info`) never touch the device and
//! never wait for a new frame.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::frame::{Frame, FrameBuffer, Resolution};
use crate::ingest::{
    BoardCameraUnavailable, CameraConfig, CaptureDevice, DeviceOpener, SourceKind,
    SystemDeviceOpener,
};
use crate::ConfigRejected;

/// Pause after a failed grab or while the handle is closed.
const RETRY_DELAY: Duration = Duration::from_millis(500);
/// Upper bound on how long `release` waits for the acquisition thread.
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Snapshot of the camera state for status pages and health logs.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CameraInfo {
    pub resolution: String,
    pub source: String,
    pub source_kind: &'static str,
    /// Instantaneous FPS, rounded to one decimal; 0 when idle.
    pub fps: f32,
    pub running: bool,
    pub frames_captured: u64,
}

pub struct FrameSource {
    opener: Arc<dyn DeviceOpener>,
    buffer: Arc<FrameBuffer>,
    stats: Arc<LoopStats>,
    config: Mutex<CameraConfig>,
    worker: Mutex<Option<Worker>>,
}

#[derive(Default)]
struct LoopStats {
    /// f32 bits of the last FPS sample.
    fps_bits: AtomicU32,
    frames: AtomicU64,
}

impl LoopStats {
    fn fps(&self) -> f32 {
        f32::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }

    fn set_fps(&self, fps: f32) {
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }
}

struct Worker {
    description: String,
    stop: Arc<AtomicBool>,
    done: mpsc::Receiver<()>,
    join: JoinHandle<()>,
}

impl FrameSource {
    pub fn new(config: CameraConfig) -> Self {
        Self::with_opener(config, Arc::new(SystemDeviceOpener))
    }

    pub fn with_opener(config: CameraConfig, opener: Arc<dyn DeviceOpener>) -> Self {
        Self {
            opener,
            buffer: Arc::new(FrameBuffer::new()),
            stats: Arc::new(LoopStats::default()),
            config: Mutex::new(config),
            worker: Mutex::new(None),
        }
    }

    /// Open the configured source and start the acquisition thread.
    ///
    /// Calling `start` while running is a no-op. A missing board camera falls
    /// back to local device 0; the call only fails if that also cannot open.
    pub fn start(&self) -> Result<()> {
        let mut worker = lock(&self.worker);
        self.start_locked(&mut worker)
    }

    /// Stop the acquisition thread and release the device. Safe to repeat.
    pub fn release(&self) {
        let mut worker = lock(&self.worker);
        self.release_locked(&mut worker);
    }

    pub fn is_running(&self) -> bool {
        lock(&self.worker).is_some()
    }

    /// Switch to another source, restarting if currently running.
    pub fn set_source(&self, source: SourceKind) -> Result<()> {
        self.reconfigure(|config| config.source = source)
    }

    /// Classify `identifier` (device index, board sentinel, or URL) and switch to it.
    pub fn set_source_identifier(&self, identifier: &str) -> Result<()> {
        let source = SourceKind::classify(identifier)?;
        self.set_source(source)
    }

    /// Change the output resolution, restarting if currently running.
    pub fn set_resolution(&self, resolution: Resolution) -> Result<()> {
        if resolution.width == 0 || resolution.height == 0 {
            return Err(ConfigRejected::new("Invalid resolution format").into());
        }
        self.reconfigure(|config| config.resolution = resolution)
    }

    pub fn config(&self) -> CameraConfig {
        lock(&self.config).clone()
    }

    /// Copy of the latest frame; `None` before the first capture.
    pub fn read(&self) -> Option<Frame> {
        self.buffer.latest()
    }

    /// JPEG of the latest frame, or of a blank frame at the configured
    /// resolution when there is none.
    pub fn get_frame_encoded(&self, quality: u8) -> Vec<u8> {
        let frame = self
            .read()
            .unwrap_or_else(|| Frame::blank(self.config().resolution));
        match frame.encode_jpeg(quality) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                log::warn!("FrameSource: jpeg encode failed: {:#}", err);
                Vec::new()
            }
        }
    }

    pub fn info(&self) -> CameraInfo {
        let config = self.config();
        let running = self.is_running();
        let fps = if running { self.stats.fps() } else { 0.0 };
        CameraInfo {
            resolution: config.resolution.to_string(),
            source: config.source.to_string(),
            source_kind: config.source.label(),
            fps: (fps * 10.0).round() / 10.0,
            running,
            frames_captured: self.stats.frames.load(Ordering::Relaxed),
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle (callers hold the worker lock)
    // ------------------------------------------------------------------------

    fn reconfigure(&self, apply: impl FnOnce(&mut CameraConfig)) -> Result<()> {
        let mut worker = lock(&self.worker);
        let was_running = worker.is_some();
        if was_running {
            self.release_locked(&mut worker);
        }
        apply(&mut lock(&self.config));
        if was_running {
            self.start_locked(&mut worker)?;
        }
        Ok(())
    }

    fn start_locked(&self, worker: &mut Option<Worker>) -> Result<()> {
        if worker.is_some() {
            return Ok(());
        }
        self.buffer.clear();
        self.stats.set_fps(0.0);

        let requested = self.config();
        let (device, config) = self.open_with_fallback(requested)?;
        let description = device.describe();
        let session = self.buffer.open_session();

        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel();
        let acquisition = Acquisition {
            device,
            target: config.resolution,
            buffer: Arc::clone(&self.buffer),
            session,
            stats: Arc::clone(&self.stats),
            stop: Arc::clone(&stop),
        };
        let join = thread::Builder::new()
            .name("frame-acquisition".to_string())
            .spawn(move || {
                acquisition.run();
                let _ = done_tx.send(());
            })
            .context("spawn acquisition thread")?;

        log::info!(
            "FrameSource: started {} at {}",
            description,
            config.resolution
        );
        *worker = Some(Worker {
            description,
            stop,
            done: done_rx,
            join,
        });
        Ok(())
    }

    fn open_with_fallback(
        &self,
        config: CameraConfig,
    ) -> Result<(Box<dyn CaptureDevice>, CameraConfig)> {
        match self.opener.open(&config.source, config.resolution) {
            Ok(device) => Ok((device, config)),
            Err(err) if err.downcast_ref::<BoardCameraUnavailable>().is_some() => {
                log::warn!(
                    "FrameSource: {}; falling back to local device 0",
                    err
                );
                let fallback = CameraConfig {
                    source: SourceKind::LocalDevice(0),
                    ..config
                };
                let device = self
                    .opener
                    .open(&fallback.source, fallback.resolution)
                    .context("open fallback local device 0")?;
                *lock(&self.config) = fallback.clone();
                Ok((device, fallback))
            }
            Err(err) => Err(err.context(format!("open camera source {}", config.source))),
        }
    }

    fn release_locked(&self, worker: &mut Option<Worker>) {
        let Some(worker) = worker.take() else {
            return;
        };
        worker.stop.store(true, Ordering::SeqCst);
        match worker.done.recv_timeout(JOIN_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.join.join().is_err() {
                    log::warn!(
                        "FrameSource: acquisition thread for {} panicked",
                        worker.description
                    );
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                // The thread still owns the device. Its session is retired
                // below, so its next publish fails and it exits.
                log::warn!(
                    "FrameSource: acquisition thread for {} did not stop within {:?}; detaching",
                    worker.description,
                    JOIN_TIMEOUT
                );
            }
        }
        self.buffer.clear();
        self.stats.set_fps(0.0);
        log::info!("FrameSource: released {}", worker.description);
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.release();
    }
}

// ----------------------------------------------------------------------------
// Acquisition loop
// ----------------------------------------------------------------------------

struct Acquisition {
    device: Box<dyn CaptureDevice>,
    target: Resolution,
    buffer: Arc<FrameBuffer>,
    session: u64,
    stats: Arc<LoopStats>,
    stop: Arc<AtomicBool>,
}

impl Acquisition {
    fn run(mut self) {
        let mut last_frame_at: Option<Instant> = None;
        while !self.stop.load(Ordering::SeqCst) {
            if !self.device.is_open() {
                thread::sleep(RETRY_DELAY);
                continue;
            }
            let frame = match self.device.grab().and_then(|f| f.resized(self.target)) {
                Ok(frame) => frame,
                Err(err) => {
                    log::debug!("FrameSource: grab failed, retrying: {:#}", err);
                    thread::sleep(RETRY_DELAY);
                    continue;
                }
            };

            let now = Instant::now();
            let fps = last_frame_at
                .map(|last| now.duration_since(last).as_secs_f32())
                .filter(|interval| *interval > 0.0)
                .map(|interval| 1.0 / interval);
            last_frame_at = Some(now);
            if !self.buffer.publish(self.session, frame.with_fps(fps)) {
                log::debug!("FrameSource: session {} retired, stopping", self.session);
                break;
            }
            if let Some(fps) = fps {
                self.stats.set_fps(fps);
            }
            self.stats.frames.fetch_add(1, Ordering::Relaxed);
        }
        self.device.release();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wait up to `timeout` for a frame matching `predicate`.
pub fn wait_for_frame(
    source: &FrameSource,
    timeout: Duration,
    predicate: impl Fn(&Frame) -> bool,
) -> Result<Frame> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(frame) = source.read().filter(|f| predicate(f)) {
            return Ok(frame);
        }
        if Instant::now() >= deadline {
            return Err(anyhow!("no matching frame within {:?}", timeout));
        }
        thread::sleep(Duration::from_millis(10));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::SyntheticDevice;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;

    /// Board camera is never present; local devices are synthetic.
    #[derive(Default)]
    struct TestOpener {
        opens: AtomicUsize,
    }

    impl DeviceOpener for TestOpener {
        fn open(
            &self,
            source: &SourceKind,
            resolution: Resolution,
        ) -> Result<Box<dyn CaptureDevice>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            match source {
                SourceKind::BoardCamera => Err(BoardCameraUnavailable {
                    reason: "no driver in tests".to_string(),
                }
                .into()),
                SourceKind::LocalDevice(_) => Ok(Box::new(SyntheticDevice::new(resolution, 200))),
                SourceKind::NetworkStream(_) => SystemDeviceOpener.open(source, resolution),
            }
        }
    }

    fn stub_source(url: &str, resolution: Resolution) -> FrameSource {
        FrameSource::new(CameraConfig {
            source: SourceKind::NetworkStream(url.to_string()),
            resolution,
        })
    }

    #[test]
    fn concurrent_readers_never_see_torn_frames() -> Result<()> {
        let source = Arc::new(stub_source(
            "stub://pattern?fps=500",
            Resolution::new(64, 48),
        ));
        source.start()?;
        wait_for_frame(&source, Duration::from_secs(2), |_| true)?;

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let source = Arc::clone(&source);
                thread::spawn(move || {
                    for _ in 0..200 {
                        if let Some(frame) = source.read() {
                            let first = frame.pixels()[0];
                            assert!(frame.pixels().iter().all(|&p| p == first));
                        }
                    }
                })
            })
            .collect();
        for reader in readers {
            reader.join().map_err(|_| anyhow!("reader panicked"))?;
        }
        source.release();
        Ok(())
    }

    #[test]
    fn set_resolution_applies_to_later_frames() -> Result<()> {
        let source = stub_source("stub://pattern?fps=100", Resolution::new(64, 48));
        source.start()?;
        wait_for_frame(&source, Duration::from_secs(2), |f| {
            f.resolution() == Resolution::new(64, 48)
        })?;

        source.set_resolution(Resolution::new(32, 24))?;
        assert!(source.is_running());
        wait_for_frame(&source, Duration::from_secs(2), |f| {
            f.resolution() == Resolution::new(32, 24)
        })?;
        assert_eq!(source.info().resolution, "32x24");
        Ok(())
    }

    #[test]
    fn frames_are_resized_to_the_configured_resolution() -> Result<()> {
        let source = stub_source("stub://pattern?fps=100&size=80x60", Resolution::new(40, 30));
        source.start()?;
        let frame = wait_for_frame(&source, Duration::from_secs(2), |_| true)?;
        assert_eq!(frame.resolution(), Resolution::new(40, 30));
        Ok(())
    }

    /// Grabs block longer than the release join timeout.
    struct SlowDevice {
        resolution: Resolution,
        grab_time: Duration,
        closed: bool,
        released: Arc<AtomicBool>,
    }

    impl CaptureDevice for SlowDevice {
        fn describe(&self) -> String {
            "slow test device".to_string()
        }

        fn is_open(&self) -> bool {
            !self.closed
        }

        fn grab(&mut self) -> Result<Frame> {
            thread::sleep(self.grab_time);
            Ok(Frame::blank(self.resolution))
        }

        fn release(&mut self) {
            self.closed = true;
            self.released.store(true, Ordering::SeqCst);
        }
    }

    struct SlowOpener {
        grab_time: Duration,
        released: Arc<AtomicBool>,
    }

    impl DeviceOpener for SlowOpener {
        fn open(
            &self,
            _source: &SourceKind,
            resolution: Resolution,
        ) -> Result<Box<dyn CaptureDevice>> {
            Ok(Box::new(SlowDevice {
                resolution,
                grab_time: self.grab_time,
                closed: false,
                released: Arc::clone(&self.released),
            }))
        }
    }

    #[test]
    fn detached_worker_cannot_publish_after_release() -> Result<()> {
        let released = Arc::new(AtomicBool::new(false));
        let opener = Arc::new(SlowOpener {
            grab_time: Duration::from_millis(1_500),
            released: Arc::clone(&released),
        });
        let source = FrameSource::with_opener(CameraConfig::default(), opener);
        source.start()?;
        thread::sleep(Duration::from_millis(100));

        // Join times out after one second; the grab is still in flight.
        source.release();
        assert!(!source.is_running());
        assert!(!source.buffer.has_frame());

        thread::sleep(Duration::from_millis(800));
        assert!(source.read().is_none());
        assert_eq!(source.info().frames_captured, 0);

        // The stale worker exits after its rejected publish.
        let deadline = Instant::now() + Duration::from_secs(2);
        while !released.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(released.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn detached_worker_cannot_overwrite_a_restarted_session() -> Result<()> {
        let released = Arc::new(AtomicBool::new(false));
        let opener = Arc::new(SlowOpener {
            grab_time: Duration::from_millis(1_300),
            released,
        });
        let source = FrameSource::with_opener(CameraConfig::default(), opener);
        source.start()?;
        thread::sleep(Duration::from_millis(100));

        source.set_resolution(Resolution::new(32, 24))?;
        assert!(source.is_running());

        let frame = wait_for_frame(&source, Duration::from_secs(3), |_| true)?;
        assert_eq!(frame.resolution(), Resolution::new(32, 24));
        thread::sleep(Duration::from_millis(300));
        if let Some(frame) = source.read() {
            assert_eq!(frame.resolution(), Resolution::new(32, 24));
        }
        Ok(())
    }

    #[test]
    fn start_is_idempotent_and_release_repeatable() -> Result<()> {
        let opener = Arc::new(TestOpener::default());
        let source = FrameSource::with_opener(CameraConfig::default(), opener.clone());
        source.start()?;
        source.start()?;
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);

        source.release();
        source.release();
        assert!(!source.is_running());
        assert!(source.read().is_none());
        assert_eq!(source.info().fps, 0.0);
        Ok(())
    }

    #[test]
    fn missing_board_camera_falls_back_to_local_device() -> Result<()> {
        let opener = Arc::new(TestOpener::default());
        let source = FrameSource::with_opener(
            CameraConfig {
                source: SourceKind::BoardCamera,
                resolution: Resolution::new(16, 16),
            },
            opener,
        );
        source.start()?;
        assert!(source.is_running());
        assert_eq!(source.config().source, SourceKind::LocalDevice(0));
        assert_eq!(source.info().source_kind, "local_device");
        Ok(())
    }

    #[test]
    fn set_source_while_stopped_only_updates_config() -> Result<()> {
        let opener = Arc::new(TestOpener::default());
        let source = FrameSource::with_opener(CameraConfig::default(), opener.clone());
        source.set_source_identifier("stub://pattern")?;
        assert!(!source.is_running());
        assert_eq!(opener.opens.load(Ordering::SeqCst), 0);
        assert_eq!(
            source.config().source,
            SourceKind::NetworkStream("stub://pattern".to_string())
        );
        assert!(source.set_source_identifier("front-door").is_err());
        Ok(())
    }

    #[test]
    fn unreachable_network_stream_fails_to_start() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        drop(listener);

        let source = stub_source(
            &format!("http://127.0.0.1:{port}/video"),
            Resolution::default(),
        );
        assert!(source.start().is_err());
        assert!(!source.is_running());
        assert!(source.read().is_none());
        Ok(())
    }

    #[test]
    fn transient_grab_failures_are_retried() -> Result<()> {
        let source = stub_source("stub://pattern?fps=200&fail=2", Resolution::new(8, 8));
        source.start()?;
        wait_for_frame(&source, Duration::from_secs(3), |_| {
            source.info().frames_captured >= 3
        })?;
        assert!(source.is_running());
        Ok(())
    }

    #[test]
    fn encoded_frame_falls_back_to_blank() -> Result<()> {
        let source = stub_source("stub://pattern", Resolution::new(24, 16));
        let jpeg = source.get_frame_encoded(90);
        let decoded = image::load_from_memory(&jpeg)?;
        assert_eq!((decoded.width(), decoded.height()), (24, 16));
        Ok(())
    }

    #[test]
    fn info_reports_fps_after_two_frames() -> Result<()> {
        let source = stub_source("stub://pattern?fps=50", Resolution::new(8, 8));
        source.start()?;
        let frame = wait_for_frame(&source, Duration::from_secs(2), |f| f.fps.is_some())?;
        assert!(frame.fps.unwrap_or_default() > 0.0);
        let info = source.info();
        assert!(info.running);
        assert_eq!(info.source, "stub://pattern?fps=50");
        Ok(())
    }

    #[test]
    fn zero_resolution_is_rejected() {
        let source = stub_source("stub://pattern", Resolution::default());
        let err = source.set_resolution(Resolution::new(0, 10)).unwrap_err();
        assert!(err.downcast_ref::<ConfigRejected>().is_some());
    }
}
