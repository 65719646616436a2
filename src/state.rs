//! State shared between the capture thread, the face worker and the web server

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::faces::FaceBox;
use crate::storage::Storage;

pub struct AppState {
    /// Latest annotated JPEG
    pub current_frame: RwLock<Option<Bytes>>,
    pub frame_count: RwLock<u64>,
    /// Description of the connected camera, `None` while disconnected
    pub camera: RwLock<Option<String>>,
    pub streaming: AtomicBool,
    /// Set once on exit; open MJPEG streams end when they see it
    pub shutting_down: AtomicBool,
    /// Faces found in the most recent detection pass
    pub last_faces: RwLock<Vec<FaceBox>>,
    /// Frames in which at least one face was found
    pub faces_detected: RwLock<u64>,
    pub faces_saved: RwLock<u64>,
    pub storage: Option<Arc<Mutex<Storage>>>,
}

impl AppState {
    pub fn new(storage: Option<Arc<Mutex<Storage>>>) -> Self {
        Self {
            current_frame: RwLock::new(None),
            frame_count: RwLock::new(0),
            camera: RwLock::new(None),
            streaming: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            last_faces: RwLock::new(Vec::new()),
            faces_detected: RwLock::new(0),
            faces_saved: RwLock::new(0),
            storage,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Relaxed)
    }

    pub fn set_streaming(&self, streaming: bool) {
        self.streaming.store(streaming, Ordering::Relaxed);
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    pub fn camera_connected(&self) -> bool {
        self.camera.read().is_some()
    }

    /// Rows waiting for sync, `None` without storage or on a query error.
    pub fn pending_captures(&self) -> Option<i64> {
        self.storage.as_ref().and_then(|s| s.lock().count().ok())
    }
}

pub type SharedState = Arc<AppState>;
