//! Error types for facecam.

use std::path::PathBuf;
use thiserror::Error;

use crate::capture::CaptureApi;

/// The main error type for camera, storage and sync operations.
#[derive(Error, Debug)]
pub enum Error {
    /// No `/dev/video*` node for the requested index.
    #[error("video device {path} not found")]
    DeviceNotFound { path: PathBuf },

    /// The capture tool could not open the device.
    #[error("failed to open {path} with {api}: {reason}")]
    CameraOpen {
        api: CaptureApi,
        path: PathBuf,
        reason: String,
    },

    /// Device opened but a frame could not be read.
    #[error("failed to read frame from {path}: {reason}")]
    FrameRead { path: PathBuf, reason: String },

    /// A helper program (`v4l2-ctl`, `fswebcam`, `lsusb`) could not be run.
    #[error("failed to run {program}: {source}")]
    Command {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// Face detector model could not be loaded.
    #[error("failed to load face model from {path}: {reason}")]
    DetectorModel { path: PathBuf, reason: String },

    #[error("face at {x},{y} lies outside the frame")]
    FaceOutsideFrame { x: i32, y: i32 },

    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Remote backend answered with a non-2xx status.
    #[error("remote rejected request ({status}): {body}")]
    Remote { status: u16, body: String },

    /// A blocking database call panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

/// Result type alias for facecam operations.
pub type Result<T> = std::result::Result<T, Error>;
