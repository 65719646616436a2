//! Camera acquisition and reconnection
//!
//! Opening a USB webcam on a freshly booted Pi is unreliable: nodes appear
//! late, the first index may belong to a codec device, and reads start
//! failing when the cable is bumped. Acquisition walks every capture API
//! and device index, retries with escalating delays, and reconnects after
//! a run of failed reads.

use image::RgbImage;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::capture::{CaptureApi, VideoMode};
use crate::config::{CameraConfig, RetryConfig};
use crate::error::Result;

/// Accepted fraction of a requested resolution when probing.
const RESOLUTION_TOLERANCE: f64 = 0.8;

/// An opened device producing RGB frames.
pub trait FrameSource: Send {
    /// Apply a mode for subsequent reads.
    fn configure(&mut self, mode: VideoMode) -> Result<()>;
    fn read_frame(&mut self) -> Result<RgbImage>;
    fn describe(&self) -> String;
}

/// Opens devices by capture API and index.
pub trait DeviceOpener: Send + Sync {
    fn open(&self, api: CaptureApi, index: u32, mode: VideoMode) -> Result<Box<dyn FrameSource>>;

    /// Whether the host currently shows any camera hardware.
    fn devices_present(&self) -> bool {
        true
    }
}

/// A device that answered with a test frame.
pub struct OpenedCamera {
    pub api: CaptureApi,
    pub index: u32,
    pub source: Box<dyn FrameSource>,
}

impl std::fmt::Debug for OpenedCamera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedCamera")
            .field("api", &self.api)
            .field("index", &self.index)
            .field("source", &self.source.describe())
            .finish()
    }
}

/// What to try when opening a camera.
#[derive(Debug, Clone)]
pub struct AcquisitionPlan {
    pub apis: Vec<CaptureApi>,
    pub indices: Vec<u32>,
    pub mode: VideoMode,
    /// Pause between configuring a device and its test read.
    pub warmup: Duration,
}

impl From<&CameraConfig> for AcquisitionPlan {
    fn from(config: &CameraConfig) -> Self {
        Self {
            apis: config.apis.clone(),
            indices: config.indices.clone(),
            mode: config.video_mode(),
            warmup: config.warmup(),
        }
    }
}

/// Retry timings for acquisition and reconnection.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub first_delay: Duration,
    pub base_delay: Duration,
    /// Added to the stabilisation delay per attempt.
    pub stabilize_step: Duration,
    /// Added to the wait between attempts per attempt.
    pub wait_step: Duration,
    pub reconnect_delay: Duration,
    pub reconnect_backoff: Duration,
    pub max_consecutive_failures: u32,
    pub failure_pause: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            first_delay: Duration::from_secs_f64(config.first_delay_secs.max(0.0)),
            base_delay: Duration::from_secs_f64(config.base_delay_secs.max(0.0)),
            stabilize_step: Duration::from_secs(3),
            wait_step: Duration::from_secs(2),
            reconnect_delay: Duration::from_secs_f64(config.reconnect_delay_secs.max(0.0)),
            reconnect_backoff: Duration::from_secs_f64(config.reconnect_backoff_secs.max(0.0)),
            max_consecutive_failures: config.max_consecutive_failures,
            failure_pause: Duration::from_millis(config.failure_pause_ms),
        }
    }
}

impl RetryPolicy {
    /// Settle time before attempt `attempt` (0-based): 3s, then base + 3s per attempt.
    pub fn stabilize_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            self.first_delay
        } else {
            self.base_delay + self.stabilize_step * attempt
        }
    }

    /// Wait after failed attempt `attempt`: base + 2s per attempt.
    pub fn wait_after_failure(&self, attempt: u32) -> Duration {
        self.base_delay + self.wait_step * attempt
    }
}

/// Interruptible sleep shared by the capture loops.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        *self.stopped.lock() = true;
        self.cv.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleep for `duration` or until stopped. Returns true if stopped.
    pub fn sleep(&self, duration: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if duration.is_zero() {
            return *stopped;
        }
        let deadline = Instant::now() + duration;
        while !*stopped {
            if self.cv.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }
}

/// One pass over every API and index.
///
/// A device counts as opened only after it returns a test frame; devices
/// that open but stay silent are released before moving on.
pub fn try_open(
    opener: &dyn DeviceOpener,
    plan: &AcquisitionPlan,
    stabilize: Duration,
    stop: &StopSignal,
) -> Option<OpenedCamera> {
    if !stabilize.is_zero() {
        info!("Waiting {:.1}s for USB devices to settle", stabilize.as_secs_f64());
        if stop.sleep(stabilize) {
            return None;
        }
    }

    for &api in &plan.apis {
        for &index in &plan.indices {
            if stop.is_stopped() {
                return None;
            }
            debug!("Trying index {} with {}", index, api);

            let mut source = match opener.open(api, index, plan.mode) {
                Ok(source) => source,
                Err(e) => {
                    debug!("Index {} with {}: {}", index, api, e);
                    continue;
                }
            };
            if let Err(e) = source.configure(plan.mode) {
                debug!("Could not configure index {} with {}: {}", index, api, e);
                continue;
            }
            if stop.sleep(plan.warmup) {
                return None;
            }

            match source.read_frame() {
                Ok(_) => {
                    info!("Camera opened at index {} using {}", index, api);
                    return Some(OpenedCamera { api, index, source });
                }
                Err(e) => debug!("Index {} with {} opened but gave no frame: {}", index, api, e),
            }
        }
    }

    None
}

/// Open a camera, retrying with escalating delays.
pub fn open_with_retries(
    opener: &dyn DeviceOpener,
    plan: &AcquisitionPlan,
    policy: &RetryPolicy,
    stop: &StopSignal,
) -> Option<OpenedCamera> {
    for attempt in 0..policy.max_attempts {
        info!("Attempt {}/{} to open the camera", attempt + 1, policy.max_attempts);

        if attempt > 0 && !opener.devices_present() {
            warn!("No USB video devices visible");
        }

        if let Some(camera) = try_open(opener, plan, policy.stabilize_delay(attempt), stop) {
            return Some(camera);
        }
        if stop.is_stopped() {
            return None;
        }

        if attempt + 1 < policy.max_attempts {
            let wait = policy.wait_after_failure(attempt);
            info!("Waiting {:.1}s before the next attempt", wait.as_secs_f64());
            warn!("If the camera is not detected, try reconnecting the USB cable");
            if stop.sleep(wait) {
                return None;
            }
        }
    }

    None
}

/// Release `current` and look for a camera again, without the settle delay.
pub fn reconnect(
    current: Option<OpenedCamera>,
    opener: &dyn DeviceOpener,
    plan: &AcquisitionPlan,
    policy: &RetryPolicy,
    stop: &StopSignal,
) -> Option<OpenedCamera> {
    warn!("Camera failure detected, reconnecting");
    drop(current);
    if stop.sleep(policy.reconnect_delay) {
        return None;
    }
    try_open(opener, plan, Duration::ZERO, stop)
}

fn within_tolerance(requested: (u32, u32), actual: (u32, u32)) -> bool {
    f64::from(actual.0) >= f64::from(requested.0) * RESOLUTION_TOLERANCE
        && f64::from(actual.1) >= f64::from(requested.1) * RESOLUTION_TOLERANCE
}

/// Pick the largest working resolution from `candidates` (largest first).
///
/// Returns the mode the device actually delivers, already applied.
pub fn select_resolution(
    source: &mut dyn FrameSource,
    candidates: &[(u32, u32)],
    fps: u32,
    settle: Duration,
    stop: &StopSignal,
) -> Option<VideoMode> {
    for &(width, height) in candidates {
        if stop.is_stopped() {
            return None;
        }
        let requested = VideoMode { width, height, fps };
        if let Err(e) = source.configure(requested) {
            debug!("{}x{} rejected: {}", width, height, e);
            continue;
        }
        if stop.sleep(settle) {
            return None;
        }

        match source.read_frame() {
            Ok(frame) if within_tolerance((width, height), frame.dimensions()) => {
                let actual = VideoMode {
                    width: frame.width(),
                    height: frame.height(),
                    fps,
                };
                info!("{}x{} -> {}", width, height, actual);
                if source.configure(actual).is_err() {
                    continue;
                }
                return Some(actual);
            }
            Ok(frame) => debug!(
                "{}x{} not supported (got {}x{})",
                width,
                height,
                frame.width(),
                frame.height()
            ),
            Err(e) => debug!("{}x{} not supported: {}", width, height, e),
        }
    }
    None
}

/// Counts consecutive read failures.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    consecutive: u32,
    threshold: u32,
}

impl FailureTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold: threshold.max(1),
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Returns true once the threshold is reached.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive >= self.threshold
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}
