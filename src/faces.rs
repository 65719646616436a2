//! Face detection and capture
//!
//! A worker thread owns the detector (rustface's SeetaFace cascade), finds
//! faces in frames handed over by the capture loop, and stores a cropped
//! thumbnail of the biggest face at most once per cooldown period.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Local;
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::capture::encode_jpeg;
use crate::config::FacesConfig;
use crate::error::{Error, Result};
use crate::state::SharedState;
use crate::storage::Storage;

/// Face rectangle in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FaceBox {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub score: f64,
}

impl FaceBox {
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

pub trait FaceDetector {
    fn detect(&mut self, gray: &GrayImage) -> Vec<FaceBox>;
}

/// SeetaFace frontal detector from `rustface`.
pub struct SeetaDetector {
    inner: Box<dyn rustface::Detector>,
}

impl SeetaDetector {
    pub fn load(model_path: &Path, config: &FacesConfig) -> Result<Self> {
        let file = File::open(model_path).map_err(|e| Error::DetectorModel {
            path: model_path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let model = rustface::read_model(BufReader::new(file)).map_err(|e| Error::DetectorModel {
            path: model_path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut inner = rustface::create_detector_with_model(model);
        // rustface rejects windows below 20px
        inner.set_min_face_size(config.min_face_size.max(20));
        inner.set_score_thresh(config.score_threshold);
        inner.set_pyramid_scale_factor(config.pyramid_scale);
        inner.set_slide_window_step(config.window_step, config.window_step);

        tracing::info!("Face model loaded from {}", model_path.display());
        Ok(Self { inner })
    }
}

impl FaceDetector for SeetaDetector {
    fn detect(&mut self, gray: &GrayImage) -> Vec<FaceBox> {
        let (width, height) = gray.dimensions();
        let mut image = rustface::ImageData::new(gray, width, height);
        self.inner
            .detect(&mut image)
            .into_iter()
            .map(|face| {
                let bbox = face.bbox();
                FaceBox {
                    x: bbox.x(),
                    y: bbox.y(),
                    width: bbox.width(),
                    height: bbox.height(),
                    score: face.score(),
                }
            })
            .collect()
    }
}

/// Size and shape checks applied to raw detections.
#[derive(Debug, Clone)]
pub struct FaceFilter {
    pub min_score: f64,
    pub min_side: u32,
    pub max_side: u32,
    pub min_aspect: f64,
    pub max_aspect: f64,
}

impl From<&FacesConfig> for FaceFilter {
    fn from(config: &FacesConfig) -> Self {
        Self {
            min_score: config.min_score,
            min_side: config.min_side,
            max_side: config.max_side,
            min_aspect: config.min_aspect,
            max_aspect: config.max_aspect,
        }
    }
}

impl FaceFilter {
    pub fn accepts(&self, face: &FaceBox) -> bool {
        if face.width == 0 || face.height == 0 || face.score < self.min_score {
            return false;
        }
        if face.width < self.min_side || face.height < self.min_side {
            return false;
        }
        if self.max_side > 0 && (face.width > self.max_side || face.height > self.max_side) {
            return false;
        }
        let aspect = f64::from(face.width) / f64::from(face.height);
        (self.min_aspect..=self.max_aspect).contains(&aspect)
    }
}

/// Largest face by area.
pub fn biggest_face(faces: &[FaceBox]) -> Option<FaceBox> {
    faces.iter().copied().max_by_key(FaceBox::area)
}

/// Crop `face` padded by `margin_ratio` of its longer side, clamped to the frame.
///
/// Returns `None` when nothing of the face lies inside the frame.
pub fn crop_with_margin(img: &RgbImage, face: &FaceBox, margin_ratio: f64) -> Option<RgbImage> {
    let (w, h) = (i64::from(img.width()), i64::from(img.height()));
    let pad = (f64::from(face.width.max(face.height)) * margin_ratio) as i64;

    let x1 = (i64::from(face.x) - pad).max(0);
    let y1 = (i64::from(face.y) - pad).max(0);
    let x2 = (i64::from(face.x) + i64::from(face.width) + pad).min(w);
    let y2 = (i64::from(face.y) + i64::from(face.height) + pad).min(h);

    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    Some(
        imageops::crop_imm(img, x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32)
            .to_image(),
    )
}

/// Resize to `size`x`size`, JPEG encode, base64.
pub fn encode_thumbnail(img: &RgbImage, size: u32, quality: u8) -> Result<String> {
    let resized = imageops::resize(img, size, size, FilterType::Triangle);
    let jpeg = encode_jpeg(&resized, quality)?;
    Ok(STANDARD.encode(jpeg))
}

/// Result of one detection pass.
#[derive(Debug, Clone, Default)]
pub struct ProcessedFrame {
    pub faces: Vec<FaceBox>,
    /// Row id when a face was stored
    pub saved: Option<i64>,
}

/// Detect, then store the biggest face once per cooldown.
pub struct FaceCapture {
    detector: Box<dyn FaceDetector>,
    filter: FaceFilter,
    cooldown: Duration,
    margin_ratio: f64,
    thumbnail_size: u32,
    thumbnail_quality: u8,
    storage: Arc<Mutex<Storage>>,
    last_saved: Option<Instant>,
}

impl FaceCapture {
    pub fn new(detector: Box<dyn FaceDetector>, config: &FacesConfig, storage: Arc<Mutex<Storage>>) -> Self {
        Self {
            detector,
            filter: FaceFilter::from(config),
            cooldown: config.cooldown(),
            margin_ratio: config.margin_ratio,
            thumbnail_size: config.thumbnail_size,
            thumbnail_quality: config.thumbnail_quality,
            storage,
            last_saved: None,
        }
    }

    fn cooldown_elapsed(&self, now: Instant) -> bool {
        self.last_saved
            .map_or(true, |last| now.saturating_duration_since(last) >= self.cooldown)
    }

    pub fn process(&mut self, frame: &RgbImage, now: Instant) -> ProcessedFrame {
        let gray = imageops::grayscale(frame);
        let faces: Vec<FaceBox> = self
            .detector
            .detect(&gray)
            .into_iter()
            .filter(|face| self.filter.accepts(face))
            .collect();

        let mut saved = None;
        if self.cooldown_elapsed(now) {
            if let Some(face) = biggest_face(&faces) {
                match self.save(frame, &face) {
                    Ok(id) => {
                        self.last_saved = Some(now);
                        tracing::info!(
                            "Face saved at {} ({}x{}, score {:.2})",
                            Local::now().format("%Y-%m-%d %H:%M:%S"),
                            face.width,
                            face.height,
                            face.score
                        );
                        saved = Some(id);
                    }
                    Err(e) => tracing::error!("Failed to save face: {}", e),
                }
            }
        }

        ProcessedFrame { faces, saved }
    }

    fn save(&self, frame: &RgbImage, face: &FaceBox) -> Result<i64> {
        let crop = crop_with_margin(frame, face, self.margin_ratio)
            .ok_or(Error::FaceOutsideFrame { x: face.x, y: face.y })?;
        let image_base64 = encode_thumbnail(&crop, self.thumbnail_size, self.thumbnail_quality)?;
        self.storage.lock().insert(&image_base64, Local::now())
    }
}

/// Request to the face worker thread
enum FaceRequest {
    Frame(Arc<RgbImage>),
    Shutdown,
}

/// Detection thread fed by the capture loop.
pub struct FaceWorker {
    request_tx: SyncSender<FaceRequest>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FaceWorker {
    /// Start the worker. `make_detector` runs on the worker thread, so the
    /// detector itself need not be `Send`.
    pub fn spawn<F>(make_detector: F, config: FacesConfig, storage: Arc<Mutex<Storage>>, state: SharedState) -> Self
    where
        F: FnOnce() -> Result<Box<dyn FaceDetector>> + Send + 'static,
    {
        let (request_tx, request_rx) = mpsc::sync_channel::<FaceRequest>(1);

        let handle = thread::Builder::new()
            .name("face-worker".to_string())
            .spawn(move || match make_detector() {
                Ok(detector) => {
                    let capture = FaceCapture::new(detector, &config, storage);
                    worker_loop(request_rx, capture, &state);
                }
                Err(e) => tracing::error!("Face detection disabled: {}", e),
            })
            .map_err(|e| tracing::error!("Failed to start face worker: {}", e))
            .ok();

        Self { request_tx, handle }
    }

    /// Hand a frame over without blocking. Returns false if it was dropped.
    pub fn submit(&self, frame: Arc<RgbImage>) -> bool {
        match self.request_tx.try_send(FaceRequest::Frame(frame)) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => false,
        }
    }
}

impl Drop for FaceWorker {
    fn drop(&mut self) {
        let _ = self.request_tx.send(FaceRequest::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(request_rx: Receiver<FaceRequest>, mut capture: FaceCapture, state: &SharedState) {
    tracing::info!("Face worker ready");

    for request in request_rx {
        match request {
            FaceRequest::Frame(frame) => {
                let outcome = capture.process(&frame, Instant::now());
                if !outcome.faces.is_empty() {
                    *state.faces_detected.write() += 1;
                }
                if outcome.saved.is_some() {
                    *state.faces_saved.write() += 1;
                }
                *state.last_faces.write() = outcome.faces;
            }
            FaceRequest::Shutdown => break,
        }
    }

    tracing::info!("Face worker stopped");
}
