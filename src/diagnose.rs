//! `facecam diagnose`: camera, permission and environment report

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use crate::camera::DeviceOpener;
use crate::error::Result;
use crate::capture::{CaptureApi, VideoMode};
use crate::config::{mask_secret, Config};
use crate::devices::{list_video_devices, mentions_camera, run_command};
use crate::grabber::TROUBLESHOOTING;

const REQUIRED_ENV: &[(&str, &str)] = &[
    ("SUPABASE_URL", "Supabase project URL"),
    ("SUPABASE_ANON_KEY", "Supabase anon key"),
    ("DEVICE_ID", "device identifier"),
];

/// Frames read by the continuous capture test.
pub const CAPTURE_TEST_FRAMES: u32 = 10;
const CAPTURE_TEST_PAUSE: Duration = Duration::from_millis(500);

/// Frame size on success, the failure otherwise.
pub type FrameOutcome = std::result::Result<(u32, u32), String>;

/// Outcome of one API × index probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub api: CaptureApi,
    pub index: u32,
    /// Frame size on success, the failure otherwise
    pub outcome: FrameOutcome,
}

/// How a device held up over consecutive reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureGrade {
    Good,
    Intermittent,
    Failing,
}

impl CaptureGrade {
    fn describe(self) -> &'static str {
        match self {
            CaptureGrade::Good => "camera is working well",
            CaptureGrade::Intermittent => "camera has intermittent problems",
            CaptureGrade::Failing => "camera has serious problems",
        }
    }
}

/// Grade `successes` out of [`CAPTURE_TEST_FRAMES`] reads: 8 or more is good,
/// 5 to 7 intermittent, fewer failing.
pub fn grade_capture(successes: u32) -> CaptureGrade {
    match successes {
        n if n >= 8 => CaptureGrade::Good,
        n if n >= 5 => CaptureGrade::Intermittent,
        _ => CaptureGrade::Failing,
    }
}

/// What the summary is based on.
#[derive(Debug, Clone)]
pub struct Diagnosis {
    pub video_devices: Vec<PathBuf>,
    pub probes: Vec<ProbeResult>,
    pub fswebcam_ok: bool,
    /// Continuous capture result of the first working device
    pub capture_grade: Option<CaptureGrade>,
}

impl Diagnosis {
    pub fn camera_works(&self) -> bool {
        self.probes.iter().any(|probe| probe.outcome.is_ok())
    }
}

/// Whether `groups` output lists `video`.
pub fn in_video_group(groups: &str) -> bool {
    groups.split_whitespace().any(|group| group == "video")
}

/// Display value for an environment variable; keys are masked.
pub fn display_env_value(name: &str, value: &str) -> String {
    if name.contains("KEY") {
        mask_secret(value)
    } else {
        value.to_string()
    }
}

/// Lines of `ps -eo pid,args` output that belong to another facecam process.
pub fn other_facecam_processes(ps_output: &str, own_pid: u32) -> Vec<String> {
    ps_output
        .lines()
        .map(str::trim)
        .filter(|line| line.contains("facecam") && !line.contains("grep"))
        .filter(|line| {
            line.split_whitespace()
                .next()
                .and_then(|pid| pid.parse::<u32>().ok())
                .is_some_and(|pid| pid != own_pid)
        })
        .map(str::to_string)
        .collect()
}

/// `PRETTY_NAME` from `/etc/os-release` content.
pub fn os_pretty_name(os_release: &str) -> Option<String> {
    os_release
        .lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|value| value.trim().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

/// Driver and card lines of `v4l2-ctl --info`, or the start of the output.
pub fn summarize_v4l2_info(info: &str) -> String {
    let fields: Vec<String> = info
        .lines()
        .filter_map(|line| line.split_once(':'))
        .filter(|(name, _)| matches!(name.trim(), "Driver name" | "Card type"))
        .map(|(name, value)| format!("{}: {}", name.trim(), value.trim()))
        .collect();
    if !fields.is_empty() {
        return fields.join(", ");
    }
    info.chars().take(100).collect::<String>().replace('\n', " ")
}

/// Open one device and read `frames` frames, `pause` apart.
pub fn read_consecutive(
    opener: &dyn DeviceOpener,
    api: CaptureApi,
    index: u32,
    mode: VideoMode,
    frames: u32,
    pause: Duration,
) -> Result<Vec<FrameOutcome>> {
    let mut source = opener.open(api, index, mode)?;
    let mut outcomes = Vec::with_capacity(frames as usize);
    for frame in 0..frames {
        outcomes.push(
            source
                .read_frame()
                .map(|image| image.dimensions())
                .map_err(|e| e.to_string()),
        );
        if frame + 1 < frames {
            thread::sleep(pause);
        }
    }
    Ok(outcomes)
}

/// Try every API on every index and read one frame.
pub fn probe_devices(
    opener: &dyn DeviceOpener,
    apis: &[CaptureApi],
    indices: &[u32],
    mode: VideoMode,
) -> Vec<ProbeResult> {
    let mut results = Vec::new();
    for &index in indices {
        for &api in apis {
            let outcome = opener
                .open(api, index, mode)
                .and_then(|mut source| source.read_frame())
                .map(|frame| frame.dimensions())
                .map_err(|e| e.to_string());
            results.push(ProbeResult { api, index, outcome });
        }
    }
    results
}

fn section(title: &str) {
    println!();
    println!("{title}");
    println!("{}", "-".repeat(title.len()));
}

fn check_system() {
    section("System");
    let release = run_command("uname", &["-r"]);
    println!("  OS:           {} {}", std::env::consts::OS, release.stdout);
    if let Some(name) = std::fs::read_to_string("/etc/os-release")
        .ok()
        .as_deref()
        .and_then(os_pretty_name)
    {
        println!("  Distribution: {name}");
    }
    println!("  Architecture: {}", std::env::consts::ARCH);
    println!("  facecam:      {}", env!("CARGO_PKG_VERSION"));
}

fn check_usb() {
    section("USB devices");
    let lsusb = run_command("lsusb", &[]);
    if lsusb.stdout.is_empty() {
        println!("[FAIL] lsusb failed: {}", lsusb.stderr);
        return;
    }
    println!("{}", lsusb.stdout);
    if mentions_camera(&lsusb.stdout) {
        println!("[ OK ] Possible USB camera detected");
    } else {
        println!("[WARN] No obvious USB camera listed");
    }
}

fn check_video_nodes() -> Vec<PathBuf> {
    section("Video devices");
    let nodes = list_video_devices();
    if nodes.is_empty() {
        println!("[FAIL] No /dev/video* devices found");
    } else {
        println!("[ OK ] Found {} device(s)", nodes.len());
        for node in &nodes {
            let node_arg = node.display().to_string();
            let info = run_command("v4l2-ctl", &["--device", &node_arg, "--info"]);
            if info.success {
                println!("       {}: {}", node_arg, summarize_v4l2_info(&info.stdout));
            } else {
                println!("       {node_arg}");
            }
        }
    }
    nodes
}

fn check_v4l2() {
    section("V4L2 devices");
    let output = run_command("v4l2-ctl", &["--list-devices"]);
    if output.stdout.is_empty() {
        println!("[FAIL] v4l2-ctl unavailable. Install with: sudo apt install v4l-utils");
        if !output.stderr.is_empty() {
            println!("       {}", output.stderr);
        }
    } else {
        println!("{}", output.stdout);
    }
}

fn check_groups() {
    section("User groups");
    let output = run_command("groups", &[]);
    if output.stdout.is_empty() {
        println!("[FAIL] Could not read groups: {}", output.stderr);
        return;
    }
    if in_video_group(&output.stdout) {
        println!("[ OK ] User is in the 'video' group");
    } else {
        println!("[WARN] User is NOT in the 'video' group");
        println!("       Run: sudo usermod -a -G video $USER, then log out and back in");
    }
    println!("       Groups: {}", output.stdout);
}

fn check_environment(config: &Config) {
    section("Environment");
    for (name, description) in REQUIRED_ENV {
        match std::env::var(name) {
            Ok(value) if !value.is_empty() => {
                println!("[ OK ] {}: {}", name, display_env_value(name, &value));
            }
            _ => println!("[FAIL] {name}: not set ({description})"),
        }
    }
    if config.sync.is_configured() {
        println!("[ OK ] Sync enabled as device '{}'", config.sync.device_id());
    } else {
        println!("[WARN] Sync disabled: sync.url and sync.anon_key are required");
    }
}

fn check_processes() {
    section("Running processes");
    let output = run_command("ps", &["-eo", "pid,args"]);
    if !output.success {
        println!("[FAIL] Could not list processes: {}", output.stderr);
        return;
    }
    let others = other_facecam_processes(&output.stdout, std::process::id());
    if others.is_empty() {
        println!("[ OK ] No other facecam process is running");
    } else {
        println!("[WARN] Another facecam process may hold the camera:");
        for line in others {
            println!("       {line}");
        }
    }
}

fn check_probes(opener: &dyn DeviceOpener, config: &Config) -> Vec<ProbeResult> {
    section("Camera probe");
    let probes = probe_devices(
        opener,
        &config.camera.apis,
        &config.camera.indices,
        config.camera.video_mode(),
    );
    for probe in &probes {
        match &probe.outcome {
            Ok((w, h)) => println!("[ OK ] index {} with {}: {}x{}", probe.index, probe.api, w, h),
            Err(e) => println!("[FAIL] index {} with {}: {}", probe.index, probe.api, e),
        }
    }
    probes
}

fn check_continuous_capture(
    opener: &dyn DeviceOpener,
    probes: &[ProbeResult],
    mode: VideoMode,
) -> Option<CaptureGrade> {
    section("Continuous capture");
    let Some(working) = probes.iter().find(|probe| probe.outcome.is_ok()) else {
        println!("[FAIL] No working camera to test");
        return None;
    };
    println!(
        "Reading {} frames from index {} with {}",
        CAPTURE_TEST_FRAMES, working.index, working.api
    );

    let outcomes = match read_consecutive(
        opener,
        working.api,
        working.index,
        mode,
        CAPTURE_TEST_FRAMES,
        CAPTURE_TEST_PAUSE,
    ) {
        Ok(outcomes) => outcomes,
        Err(e) => {
            println!("[FAIL] Could not reopen the camera: {e}");
            return Some(CaptureGrade::Failing);
        }
    };

    for (i, outcome) in outcomes.iter().enumerate() {
        match outcome {
            Ok((w, h)) => println!("  Frame {:>2}: OK ({}x{})", i + 1, w, h),
            Err(e) => println!("  Frame {:>2}: FAILED ({})", i + 1, e),
        }
    }
    let successes = outcomes.iter().filter(|outcome| outcome.is_ok()).count() as u32;
    let grade = grade_capture(successes);
    let tag = if grade == CaptureGrade::Good { "[ OK ]" } else { "[WARN]" };
    println!("{} {}/{} frames captured: {}", tag, successes, CAPTURE_TEST_FRAMES, grade.describe());
    Some(grade)
}

fn check_fswebcam() -> bool {
    section("fswebcam test capture");
    let target = std::env::temp_dir().join(format!("facecam_test_{}.jpg", std::process::id()));
    let target_arg = target.display().to_string();
    let output = run_command("fswebcam", &["-r", "320x240", "--no-banner", &target_arg]);

    let captured = target.exists();
    let _ = std::fs::remove_file(&target);
    if captured {
        println!("[ OK ] fswebcam captured an image");
    } else if !output.launched {
        println!("[FAIL] fswebcam not installed. Install with: sudo apt install fswebcam");
    } else {
        println!("[FAIL] fswebcam could not capture");
        if !output.stderr.is_empty() {
            println!("       {}", output.stderr);
        }
    }
    captured
}

/// Print the full report.
pub fn run(config: &Config, opener: &dyn DeviceOpener) -> Diagnosis {
    println!("facecam diagnostics");
    println!("===================");
    if !cfg!(target_os = "linux") {
        println!("[WARN] These checks assume Linux / Raspberry Pi OS");
    }

    check_system();
    check_usb();
    let video_devices = check_video_nodes();
    check_v4l2();
    check_groups();
    check_environment(config);
    check_processes();
    let probes = check_probes(opener, config);
    let capture_grade = check_continuous_capture(opener, &probes, config.camera.video_mode());
    let fswebcam_ok = check_fswebcam();

    let diagnosis = Diagnosis {
        video_devices,
        probes,
        fswebcam_ok,
        capture_grade,
    };
    print_summary(&diagnosis);
    diagnosis
}

fn print_summary(diagnosis: &Diagnosis) {
    section("Summary");
    let status = |ok: bool| if ok { "OK" } else { "FAILED" };
    println!("  Camera probe:  {}", status(diagnosis.camera_works()));
    println!(
        "  Capture test:  {}",
        diagnosis.capture_grade.map_or("not run", CaptureGrade::describe)
    );
    println!("  fswebcam:      {}", status(diagnosis.fswebcam_ok));
    println!("  Video devices: {} found", diagnosis.video_devices.len());

    if diagnosis.camera_works() {
        println!();
        println!("Camera works. `facecam run` should be able to use it.");
        return;
    }
    println!();
    println!("Problems detected. Things to try:");
    for hint in TROUBLESHOOTING {
        println!("  - {hint}");
    }
    println!("  - sudo apt update && sudo apt install fswebcam v4l-utils && sudo reboot");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::tests::{FakeOpener, Slot};

    #[test]
    fn video_group_membership() {
        assert!(in_video_group("pi adm dialout cdrom sudo audio video plugdev"));
        assert!(!in_video_group("pi adm videoadmins"));
    }

    #[test]
    fn keys_are_masked() {
        let key = "eyJhbGciOiJIUzI1NiIsInR5cCI6IkpXVCJ9.payload";
        assert_eq!(display_env_value("SUPABASE_ANON_KEY", key), "eyJhbGciOi...J9.payload");
        assert_eq!(display_env_value("DEVICE_ID", "raspi-01"), "raspi-01");
    }

    #[test]
    fn finds_other_facecam_processes() {
        let ps = "  PID COMMAND\n  101 /usr/bin/facecam run\n  202 grep facecam\n  303 facecam diagnose\n  404 bash";
        let others = other_facecam_processes(ps, 303);
        assert_eq!(others, vec!["101 /usr/bin/facecam run".to_string()]);
    }

    #[test]
    fn probes_every_api_and_index() {
        let opener = FakeOpener::with(&[
            ((CaptureApi::V4l2, 0), Slot::Works(640, 480)),
            ((CaptureApi::Fswebcam, 1), Slot::Silent),
        ]);
        let mode = VideoMode { width: 320, height: 240, fps: 15 };
        let probes = probe_devices(&opener, &[CaptureApi::V4l2, CaptureApi::Fswebcam], &[0, 1], mode);

        assert_eq!(probes.len(), 4);
        assert_eq!(probes[0].outcome, Ok((320, 240)));
        assert!(probes[1].outcome.is_err());
        assert!(probes[3].outcome.is_err());

        let diagnosis = Diagnosis {
            video_devices: vec![],
            probes,
            fswebcam_ok: false,
            capture_grade: None,
        };
        assert!(diagnosis.camera_works());
    }

    #[test]
    fn capture_grades_follow_success_counts() {
        assert_eq!(grade_capture(10), CaptureGrade::Good);
        assert_eq!(grade_capture(8), CaptureGrade::Good);
        assert_eq!(grade_capture(7), CaptureGrade::Intermittent);
        assert_eq!(grade_capture(5), CaptureGrade::Intermittent);
        assert_eq!(grade_capture(4), CaptureGrade::Failing);
        assert_eq!(grade_capture(0), CaptureGrade::Failing);
    }

    #[test]
    fn consecutive_reads_report_every_frame() {
        let opener = FakeOpener::with(&[
            ((CaptureApi::V4l2, 0), Slot::Works(640, 480)),
            ((CaptureApi::V4l2, 1), Slot::Silent),
        ]);
        let mode = VideoMode { width: 320, height: 240, fps: 15 };

        let good = read_consecutive(&opener, CaptureApi::V4l2, 0, mode, CAPTURE_TEST_FRAMES, Duration::ZERO)
            .unwrap();
        assert_eq!(good.len(), 10);
        assert!(good.iter().all(|outcome| *outcome == Ok((320, 240))));

        let silent = read_consecutive(&opener, CaptureApi::V4l2, 1, mode, 4, Duration::ZERO).unwrap();
        assert_eq!(silent.len(), 4);
        assert!(silent.iter().all(|outcome| outcome.is_err()));

        assert!(read_consecutive(&opener, CaptureApi::Fswebcam, 0, mode, 4, Duration::ZERO).is_err());
    }

    #[test]
    fn v4l2_info_summary_picks_driver_and_card() {
        let info = "Driver Info:\n\tDriver name      : uvcvideo\n\tCard type        : USB 2.0 Camera: HD USB Camera\n\tBus info         : usb-0000:01:00.0-1.2";
        assert_eq!(
            summarize_v4l2_info(info),
            "Driver name: uvcvideo, Card type: USB 2.0 Camera: HD USB Camera"
        );
        assert_eq!(summarize_v4l2_info("short\noutput"), "short output");
    }

    #[test]
    fn os_release_pretty_name() {
        let os_release = "NAME=\"Debian GNU/Linux\"\nPRETTY_NAME=\"Raspbian GNU/Linux 12 (bookworm)\"\nID=raspbian";
        assert_eq!(os_pretty_name(os_release).as_deref(), Some("Raspbian GNU/Linux 12 (bookworm)"));
        assert_eq!(os_pretty_name("ID=arch"), None);
    }
}
