//! V4L2 capture module for USB webcams
//!
//! Frames are grabbed by running `v4l2-ctl` (one MJPEG frame per call) or
//! `fswebcam`, then decoded with `image`. No V4L2 bindings are needed.

use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::camera::{DeviceOpener, FrameSource};
use crate::error::{Error, Result};

static FRAME_COUNTER: AtomicU64 = AtomicU64::new(0);
static CAMERA_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Program used to pull frames from a device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureApi {
    /// `v4l2-ctl` streaming a single MJPEG buffer
    V4l2,
    /// `fswebcam` single shot
    Fswebcam,
}

impl CaptureApi {
    pub fn program(self) -> &'static str {
        match self {
            CaptureApi::V4l2 => "v4l2-ctl",
            CaptureApi::Fswebcam => "fswebcam",
        }
    }
}

impl fmt::Display for CaptureApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureApi::V4l2 => f.write_str("v4l2"),
            CaptureApi::Fswebcam => f.write_str("fswebcam"),
        }
    }
}

impl FromStr for CaptureApi {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "v4l2" | "v4l2-ctl" | "v4l" => Ok(CaptureApi::V4l2),
            "fswebcam" | "fs" => Ok(CaptureApi::Fswebcam),
            other => Err(Error::InvalidConfig(format!(
                "unknown capture api '{other}'. Use 'v4l2' or 'fswebcam'"
            ))),
        }
    }
}

/// Requested frame geometry and rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMode {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl fmt::Display for VideoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} @ {}fps", self.width, self.height, self.fps)
    }
}

pub fn device_path(index: u32) -> PathBuf {
    PathBuf::from(format!("/dev/video{index}"))
}

/// A webcam opened through one of the capture programs.
#[derive(Debug)]
pub struct CommandCamera {
    api: CaptureApi,
    device_path: PathBuf,
    mode: VideoMode,
    temp_dir: PathBuf,
}

impl CommandCamera {
    /// Open `/dev/video{index}` with `api`.
    ///
    /// The node must exist, be readable, and answer the capture program.
    pub fn open(api: CaptureApi, index: u32, mode: VideoMode) -> Result<Self> {
        let device_path = device_path(index);
        if !device_path.exists() {
            return Err(Error::DeviceNotFound { path: device_path });
        }

        fs::File::open(&device_path).map_err(|e| Error::CameraOpen {
            api,
            path: device_path.clone(),
            reason: e.to_string(),
        })?;

        match api {
            CaptureApi::V4l2 => {
                let output = run(api.program(), &["-d", &path_arg(&device_path), "--get-fmt-video"])?;
                if !output.status.success() {
                    return Err(Error::CameraOpen {
                        api,
                        path: device_path,
                        reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                    });
                }
            }
            CaptureApi::Fswebcam => {
                // Only checks that fswebcam is installed; it opens the device per shot.
                run(api.program(), &["--version"])?;
            }
        }

        let temp_dir = std::env::temp_dir().join(format!(
            "facecam_{}_{}",
            std::process::id(),
            CAMERA_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&temp_dir)?;

        tracing::debug!("Opened {} with {}", device_path.display(), api);
        Ok(Self {
            api,
            device_path,
            mode,
            temp_dir,
        })
    }

    fn capture_jpeg(&self) -> Result<Vec<u8>> {
        let frame_num = FRAME_COUNTER.fetch_add(1, Ordering::Relaxed);
        let jpeg_path = self.temp_dir.join(format!("frame_{}.jpg", frame_num % 4));
        let device = path_arg(&self.device_path);
        let target = path_arg(&jpeg_path);

        let output = match self.api {
            CaptureApi::V4l2 => {
                let fmt = format!(
                    "--set-fmt-video=width={},height={},pixelformat=MJPG",
                    self.mode.width, self.mode.height
                );
                let parm = format!("--set-parm={}", self.mode.fps);
                let stream_to = format!("--stream-to={target}");
                run(
                    self.api.program(),
                    &[
                        "-d",
                        &device,
                        &fmt,
                        &parm,
                        "--stream-mmap=4",
                        "--stream-skip=1",
                        "--stream-count=1",
                        &stream_to,
                    ],
                )?
            }
            CaptureApi::Fswebcam => {
                let resolution = format!("{}x{}", self.mode.width, self.mode.height);
                run(
                    self.api.program(),
                    &[
                        "-q",
                        "-d",
                        &device,
                        "-r",
                        &resolution,
                        "-S",
                        "1",
                        "--no-banner",
                        "--jpeg",
                        "95",
                        &target,
                    ],
                )?
            }
        };

        if !output.status.success() {
            let _ = fs::remove_file(&jpeg_path);
            return Err(Error::FrameRead {
                path: self.device_path.clone(),
                reason: format!(
                    "{} exited with {}: {}",
                    self.api.program(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        let jpeg = fs::read(&jpeg_path).map_err(|e| Error::FrameRead {
            path: self.device_path.clone(),
            reason: e.to_string(),
        })?;
        let _ = fs::remove_file(&jpeg_path);

        if jpeg.is_empty() {
            return Err(Error::FrameRead {
                path: self.device_path.clone(),
                reason: "empty frame".to_string(),
            });
        }
        Ok(jpeg)
    }
}

impl FrameSource for CommandCamera {
    fn configure(&mut self, mode: VideoMode) -> Result<()> {
        self.mode = mode;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<RgbImage> {
        let jpeg = self.capture_jpeg()?;
        Ok(image::load_from_memory(&jpeg)?.to_rgb8())
    }

    fn describe(&self) -> String {
        format!("{} via {} ({})", self.device_path.display(), self.api, self.mode)
    }
}

impl Drop for CommandCamera {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.temp_dir);
        tracing::debug!("Released {}", self.device_path.display());
    }
}

/// Opens [`CommandCamera`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandOpener;

impl DeviceOpener for CommandOpener {
    fn open(&self, api: CaptureApi, index: u32, mode: VideoMode) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(CommandCamera::open(api, index, mode)?))
    }

    fn devices_present(&self) -> bool {
        crate::devices::usb_camera_present()
    }
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

fn run(program: &str, args: &[&str]) -> Result<std::process::Output> {
    Command::new(program)
        .args(args)
        .output()
        .map_err(|source| Error::Command {
            program: program.to_string(),
            source,
        })
}

/// Encode an RGB frame as JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut jpeg_buffer = Vec::with_capacity(64 * 1024);
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg_buffer, quality);
    encoder.encode(
        image.as_raw(),
        image.width(),
        image.height(),
        image::ExtendedColorType::Rgb8,
    )?;
    Ok(jpeg_buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_api_parses_aliases() {
        assert_eq!("V4L2".parse::<CaptureApi>().unwrap(), CaptureApi::V4l2);
        assert_eq!("v4l2-ctl".parse::<CaptureApi>().unwrap(), CaptureApi::V4l2);
        assert_eq!("fswebcam".parse::<CaptureApi>().unwrap(), CaptureApi::Fswebcam);
        assert!("dshow".parse::<CaptureApi>().is_err());
        assert_eq!(CaptureApi::V4l2.to_string(), "v4l2");
    }

    #[test]
    fn device_path_uses_video_index() {
        assert_eq!(device_path(2), PathBuf::from("/dev/video2"));
    }

    #[test]
    fn open_missing_device_reports_not_found() {
        let mode = VideoMode { width: 320, height: 240, fps: 15 };
        let err = CommandCamera::open(CaptureApi::V4l2, 4242, mode).unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound { .. }));
    }

    #[test]
    fn encode_jpeg_emits_jpeg_markers() {
        let image = RgbImage::from_pixel(32, 24, image::Rgb([10, 200, 30]));
        let jpeg = encode_jpeg(&image, 85).unwrap();

        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }
}
