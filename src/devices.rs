//! Host device probing: `/dev/video*` nodes and `lsusb`.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use crate::camera::StopSignal;

const CAMERA_KEYWORDS: &[&str] = &["camera", "webcam", "usb", "video", "capture"];

/// Captured output of a helper program.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    /// False when the program could not be started at all
    pub launched: bool,
}

/// Run `program` and capture its output. Spawn failures land in `stderr`.
pub fn run_command(program: &str, args: &[&str]) -> CommandOutput {
    match Command::new(program).args(args).output() {
        Ok(output) => CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            success: output.status.success(),
            launched: true,
        },
        Err(e) => CommandOutput {
            stdout: String::new(),
            stderr: format!("{program}: {e}"),
            success: false,
            launched: false,
        },
    }
}

/// `/dev/video*` nodes, sorted.
pub fn list_video_devices() -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir("/dev") else {
        return Vec::new();
    };
    let mut devices: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("video"))
        .map(|entry| entry.path())
        .collect();
    devices.sort();
    devices
}

/// Whether `lsusb` output mentions something camera-like.
pub fn mentions_camera(lsusb: &str) -> bool {
    let lower = lsusb.to_lowercase();
    CAMERA_KEYWORDS.iter().any(|keyword| lower.contains(keyword))
}

/// True when video nodes exist or `lsusb` lists a camera-like device.
///
/// Assumes present when nothing can be probed, so a missing `lsusb` never
/// blocks startup.
pub fn usb_camera_present() -> bool {
    let video_devices = list_video_devices();
    tracing::info!(
        "Video devices: {}",
        if video_devices.is_empty() {
            "none".to_string()
        } else {
            video_devices
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        }
    );
    if !video_devices.is_empty() {
        return true;
    }

    let lsusb = run_command("lsusb", &[]);
    if !lsusb.launched {
        tracing::warn!("Could not list USB devices: {}", lsusb.stderr);
        return true;
    }
    mentions_camera(&lsusb.stdout)
}

/// Poll `probe` until it reports devices, up to `max_wait / poll_interval` times.
pub fn wait_for<F>(mut probe: F, max_wait: Duration, poll_interval: Duration, stop: &StopSignal) -> bool
where
    F: FnMut() -> bool,
{
    let polls = if poll_interval.is_zero() {
        1
    } else {
        (max_wait.as_millis() / poll_interval.as_millis()).max(1)
    };

    for poll in 0..polls {
        if probe() {
            tracing::info!("USB devices detected");
            return true;
        }
        tracing::info!("Waiting for USB devices... ({}/{})", poll + 1, polls);
        if stop.sleep(poll_interval) {
            return false;
        }
    }

    tracing::warn!("Timed out waiting for USB devices");
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsusb_keywords_match_case_insensitively() {
        assert!(mentions_camera("Bus 001 Device 004: ID 046d:0825 Logitech, Inc. Webcam C270"));
        assert!(mentions_camera("Bus 001 Device 002: ID 2109:3431 VIA Labs, Inc. USB2.0 Hub"));
        assert!(!mentions_camera("Bus 002 Device 001: ID 1d6b:0003 Linux Foundation 3.0 root hub"));
    }

    #[test]
    fn wait_for_returns_once_probe_succeeds() {
        let stop = StopSignal::new();
        let mut calls = 0;
        let found = wait_for(
            || {
                calls += 1;
                calls == 3
            },
            Duration::from_millis(30),
            Duration::from_millis(1),
            &stop,
        );
        assert!(found);
        assert_eq!(calls, 3);
    }

    #[test]
    fn wait_for_times_out() {
        let stop = StopSignal::new();
        let mut calls = 0;
        let found = wait_for(
            || {
                calls += 1;
                false
            },
            Duration::from_millis(10),
            Duration::from_millis(2),
            &stop,
        );
        assert!(!found);
        assert_eq!(calls, 5);
    }

    #[test]
    fn run_command_reports_missing_program() {
        let output = run_command("facecam-definitely-missing-tool", &[]);
        assert!(!output.success);
        assert!(!output.launched);
        assert!(output.stderr.contains("facecam-definitely-missing-tool"));
    }
}
