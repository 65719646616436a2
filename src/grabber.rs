//! Frame capture loop
//!
//! Runs on its own thread and owns the camera: acquires it, publishes
//! annotated JPEGs for the web server, feeds the face worker and
//! reconnects after a run of failed reads.

use bytes::Bytes;
use chrono::Local;
use image::RgbImage;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::camera::{
    open_with_retries, reconnect, select_resolution, AcquisitionPlan, DeviceOpener, FailureTracker,
    OpenedCamera, RetryPolicy, StopSignal,
};
use crate::capture::encode_jpeg;
use crate::config::Config;
use crate::devices;
use crate::faces::FaceWorker;
use crate::overlay;
use crate::state::SharedState;

/// Printed when no camera could be opened.
pub const TROUBLESHOOTING: &[&str] = &[
    "Check that the camera is connected: lsusb",
    "Check video devices: ls /dev/video*",
    "Test the camera manually: fswebcam test.jpg",
    "Install tools: sudo apt install fswebcam v4l-utils",
    "Check permissions: sudo usermod -a -G video $USER, then log in again",
    "Unplug and reconnect the USB camera, or try another USB port",
    "Make sure no other process is using the camera",
];

/// Grabber settings, resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct GrabberSettings {
    pub plan: AcquisitionPlan,
    pub policy: RetryPolicy,
    pub device_wait: Duration,
    pub device_poll: Duration,
    pub frame_interval: Duration,
    pub jpeg_quality: u8,
    pub overlay_timestamp: bool,
    pub draw_faces: bool,
    pub probe_resolution: bool,
    pub resolutions: Vec<(u32, u32)>,
}

impl From<&Config> for GrabberSettings {
    fn from(config: &Config) -> Self {
        Self {
            plan: AcquisitionPlan::from(&config.camera),
            policy: RetryPolicy::from(&config.retry),
            device_wait: Duration::from_secs(config.retry.device_wait_secs),
            device_poll: Duration::from_secs(config.retry.device_poll_secs),
            frame_interval: config.camera.frame_interval(),
            jpeg_quality: config.stream.jpeg_quality,
            overlay_timestamp: config.stream.overlay_timestamp,
            draw_faces: config.stream.draw_faces,
            probe_resolution: config.stream.probe_resolution,
            resolutions: config.stream.resolutions.clone(),
        }
    }
}

pub struct Grabber<O: DeviceOpener> {
    opener: O,
    settings: GrabberSettings,
    state: SharedState,
    faces: Option<FaceWorker>,
    stop: Arc<StopSignal>,
}

impl<O: DeviceOpener> Grabber<O> {
    pub fn new(
        opener: O,
        settings: GrabberSettings,
        state: SharedState,
        faces: Option<FaceWorker>,
        stop: Arc<StopSignal>,
    ) -> Self {
        Self {
            opener,
            settings,
            state,
            faces,
            stop,
        }
    }

    /// Capture until stopped. Returns false if no camera could be acquired.
    pub fn run(self) -> bool {
        info!("Checking USB devices...");
        let opener = &self.opener;
        devices::wait_for(
            || opener.devices_present(),
            self.settings.device_wait,
            self.settings.device_poll,
            &self.stop,
        );

        let Some(mut camera) =
            open_with_retries(&self.opener, &self.settings.plan, &self.settings.policy, &self.stop)
        else {
            if !self.stop.is_stopped() {
                error!("Could not access the webcam");
                for hint in TROUBLESHOOTING {
                    error!("  - {}", hint);
                }
            }
            return false;
        };

        self.on_connected(&mut camera);
        self.state.set_streaming(true);

        let mut current = Some(camera);
        let mut failures = FailureTracker::new(self.settings.policy.max_consecutive_failures);

        while !self.stop.is_stopped() {
            match current.as_mut().map(|camera| camera.source.read_frame()) {
                Some(Ok(frame)) => {
                    failures.record_success();
                    self.publish(frame);
                    self.stop.sleep(self.settings.frame_interval);
                    continue;
                }
                Some(Err(e)) => warn!(
                    "Camera read failed ({}/{}): {}",
                    failures.consecutive() + 1,
                    failures.threshold(),
                    e
                ),
                None => warn!(
                    "Camera disconnected ({}/{})",
                    failures.consecutive() + 1,
                    failures.threshold()
                ),
            }

            self.handle_failure(&mut current, &mut failures);
            self.stop.sleep(self.settings.policy.failure_pause);
        }

        *self.state.camera.write() = None;
        self.state.set_streaming(false);
        info!("Capture loop stopped");
        true
    }

    /// Count one failed read. At the threshold the camera is released and
    /// reopened; a failed reopen waits `reconnect_backoff`. The counter
    /// restarts either way.
    fn handle_failure(&self, current: &mut Option<OpenedCamera>, failures: &mut FailureTracker) {
        if !failures.record_failure() {
            return;
        }

        info!("Too many consecutive failures, reconnecting camera");
        *self.state.camera.write() = None;
        *current = reconnect(
            current.take(),
            &self.opener,
            &self.settings.plan,
            &self.settings.policy,
            &self.stop,
        );
        match current.as_mut() {
            Some(camera) => {
                info!("Camera reconnected");
                self.on_connected(camera);
            }
            None => {
                error!(
                    "Reconnect failed, waiting {:.0}s before trying again",
                    self.settings.policy.reconnect_backoff.as_secs_f64()
                );
                self.stop.sleep(self.settings.policy.reconnect_backoff);
            }
        }
        failures.reset();
    }

    fn on_connected(&self, camera: &mut OpenedCamera) {
        if self.settings.probe_resolution {
            info!("Probing supported resolutions");
            let fps = self.settings.plan.mode.fps;
            match select_resolution(
                camera.source.as_mut(),
                &self.settings.resolutions,
                fps,
                self.settings.plan.warmup,
                &self.stop,
            ) {
                Some(mode) => info!("Best resolution: {}", mode),
                None => {
                    warn!("No probed resolution worked, keeping {}", self.settings.plan.mode);
                    let _ = camera.source.configure(self.settings.plan.mode);
                }
            }
        }
        *self.state.camera.write() = Some(camera.source.describe());
    }

    fn publish(&self, frame: RgbImage) {
        let frame = Arc::new(frame);
        if let Some(worker) = &self.faces {
            worker.submit(frame.clone());
        }

        let encoded = if self.settings.overlay_timestamp || self.settings.draw_faces {
            let mut annotated = (*frame).clone();
            if self.settings.draw_faces {
                overlay::draw_faces(&mut annotated, &self.state.last_faces.read());
            }
            if self.settings.overlay_timestamp {
                overlay::stamp_timestamp(&mut annotated, Local::now());
            }
            encode_jpeg(&annotated, self.settings.jpeg_quality)
        } else {
            encode_jpeg(&frame, self.settings.jpeg_quality)
        };

        match encoded {
            Ok(jpeg) => {
                *self.state.current_frame.write() = Some(Bytes::from(jpeg));
                *self.state.frame_count.write() += 1;
            }
            Err(e) => error!("Failed to encode frame: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::tests::{immediate_policy, plan, FakeOpener, Slot};
    use crate::camera::FrameSource;
    use crate::capture::{CaptureApi, VideoMode};
    use crate::error::{Error, Result};
    use crate::state::AppState;
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use std::thread;
    use std::time::Instant;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Open,
        Read,
        Fail,
    }

    /// `/dev/video0` over v4l2 only; every source goes quiet after `good_reads`.
    struct FlakyOpener {
        good_reads: usize,
        log: Arc<Mutex<Vec<Event>>>,
    }

    struct FlakySource {
        good_left: usize,
        mode: VideoMode,
        log: Arc<Mutex<Vec<Event>>>,
    }

    impl DeviceOpener for FlakyOpener {
        fn open(&self, api: CaptureApi, index: u32, mode: VideoMode) -> Result<Box<dyn FrameSource>> {
            if (api, index) != (CaptureApi::V4l2, 0) {
                return Err(Error::DeviceNotFound { path: PathBuf::from("/dev/fake") });
            }
            self.log.lock().push(Event::Open);
            Ok(Box::new(FlakySource {
                good_left: self.good_reads,
                mode,
                log: self.log.clone(),
            }))
        }
    }

    impl FrameSource for FlakySource {
        fn configure(&mut self, mode: VideoMode) -> Result<()> {
            self.mode = mode;
            Ok(())
        }

        fn read_frame(&mut self) -> Result<RgbImage> {
            if self.good_left == 0 {
                self.log.lock().push(Event::Fail);
                return Err(Error::FrameRead {
                    path: PathBuf::from("/dev/fake"),
                    reason: "timeout".to_string(),
                });
            }
            self.good_left -= 1;
            self.log.lock().push(Event::Read);
            Ok(RgbImage::new(self.mode.width, self.mode.height))
        }

        fn describe(&self) -> String {
            "flaky".to_string()
        }
    }

    fn settings(max_attempts: u32) -> GrabberSettings {
        GrabberSettings {
            plan: plan(),
            policy: immediate_policy(max_attempts),
            device_wait: Duration::ZERO,
            device_poll: Duration::ZERO,
            frame_interval: Duration::from_millis(1),
            jpeg_quality: 85,
            overlay_timestamp: true,
            draw_faces: true,
            probe_resolution: false,
            resolutions: vec![],
        }
    }

    #[test]
    fn publishes_frames_until_stopped() {
        let opener = FakeOpener::with(&[((CaptureApi::V4l2, 1), Slot::Works(320, 240))]);
        let state = Arc::new(AppState::new(None));
        let stop = Arc::new(StopSignal::new());
        let grabber = Grabber::new(opener, settings(1), state.clone(), None, stop.clone());
        let handle = thread::spawn(move || grabber.run());

        let deadline = Instant::now() + Duration::from_secs(10);
        while *state.frame_count.read() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(state.camera_connected());
        assert!(state.is_streaming());

        stop.stop();
        assert!(handle.join().unwrap());

        assert!(*state.frame_count.read() >= 3);
        let jpeg = state.current_frame.read().clone().unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (320, 240));
        assert!(!state.camera_connected());
        assert!(!state.is_streaming());
    }

    #[test]
    fn gives_up_without_camera() {
        let opener = FakeOpener::default();
        let state = Arc::new(AppState::new(None));
        let stop = Arc::new(StopSignal::new());
        let grabber = Grabber::new(opener, settings(2), state.clone(), None, stop);

        assert!(!grabber.run());
        assert!(state.current_frame.read().is_none());
    }

    #[test]
    fn probing_applies_best_resolution() {
        let opener = FakeOpener::with(&[((CaptureApi::V4l2, 0), Slot::Works(800, 600))]);
        let state = Arc::new(AppState::new(None));
        let stop = Arc::new(StopSignal::new());
        let mut settings = settings(1);
        settings.probe_resolution = true;
        settings.resolutions = vec![(1280, 720), (800, 600), (640, 480)];
        let grabber = Grabber::new(opener, settings, state.clone(), None, stop.clone());
        let handle = thread::spawn(move || grabber.run());

        let deadline = Instant::now() + Duration::from_secs(10);
        while state.current_frame.read().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        stop.stop();
        handle.join().unwrap();

        let jpeg = state.current_frame.read().clone().unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (800, 600));
    }

    #[test]
    fn reconnects_after_threshold_of_failed_reads() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let opener = FlakyOpener {
            good_reads: 3,
            log: log.clone(),
        };
        let state = Arc::new(AppState::new(None));
        let stop = Arc::new(StopSignal::new());
        let grabber = Grabber::new(opener, settings(1), state.clone(), None, stop.clone());
        let handle = thread::spawn(move || grabber.run());

        let opens = || log.lock().iter().filter(|e| **e == Event::Open).count();
        let deadline = Instant::now() + Duration::from_secs(10);
        while opens() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        stop.stop();
        assert!(handle.join().unwrap());

        use Event::{Fail, Open, Read};
        // Test read plus two published frames, then three failures before each reopen.
        let session = [Open, Read, Read, Read, Fail, Fail, Fail];
        let expected: Vec<Event> = session.iter().chain(session.iter()).copied().chain([Open]).collect();
        let log = log.lock();
        assert!(log.len() >= expected.len(), "log too short: {:?}", *log);
        assert_eq!(&log[..expected.len()], expected.as_slice());
        assert!(*state.frame_count.read() >= 4);
        assert!(!state.camera_connected());
    }

    #[test]
    fn failed_reconnect_backs_off_and_restarts_count() {
        let state = Arc::new(AppState::new(None));
        *state.camera.write() = Some("fake".to_string());
        let mut settings = settings(1);
        settings.policy.reconnect_backoff = Duration::from_millis(50);
        let grabber = Grabber::new(
            FakeOpener::default(),
            settings,
            state.clone(),
            None,
            Arc::new(StopSignal::new()),
        );
        let mut current = None;
        let mut failures = FailureTracker::new(3);

        grabber.handle_failure(&mut current, &mut failures);
        grabber.handle_failure(&mut current, &mut failures);
        assert_eq!(grabber.opener.call_count(), 0);
        assert!(state.camera_connected());

        let started = Instant::now();
        grabber.handle_failure(&mut current, &mut failures);
        assert!(started.elapsed() >= Duration::from_millis(50));
        // One pass over both apis and three indices
        assert_eq!(grabber.opener.call_count(), 6);
        assert!(current.is_none());
        assert!(!state.camera_connected());
        assert_eq!(failures.consecutive(), 0);

        grabber.handle_failure(&mut current, &mut failures);
        assert_eq!(grabber.opener.call_count(), 6);
        assert_eq!(failures.consecutive(), 1);
    }

    #[test]
    fn successful_reconnect_restores_camera() {
        let opener = FakeOpener::with(&[((CaptureApi::V4l2, 1), Slot::Works(320, 240))]);
        let state = Arc::new(AppState::new(None));
        let grabber = Grabber::new(opener, settings(1), state.clone(), None, Arc::new(StopSignal::new()));
        let mut current = None;
        let mut failures = FailureTracker::new(1);

        grabber.handle_failure(&mut current, &mut failures);

        let camera = current.expect("camera reopened");
        assert_eq!((camera.api, camera.index), (CaptureApi::V4l2, 1));
        assert_eq!(grabber.opener.call_count(), 2);
        assert_eq!(state.camera.read().as_deref(), Some("fake"));
        assert_eq!(failures.consecutive(), 0);
    }
}
