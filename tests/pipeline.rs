#![cfg(unix)]

mod common;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use vigil::app::Pipeline;
use vigil::stats::MemoryStats;
use vigil::Config;

use common::{eventually, get};

/// Stands in for ffmpeg: emits 4x4 RGB frames when asked to capture (last
/// argument `-`) and copies stdin into the target when asked to encode.
const FAKE_FFMPEG: &str = r#"#!/bin/sh
for last; do :; done
if [ "$last" = "-" ]; then
    while :; do
        head -c 48 /dev/zero || exit 0
        sleep 0.05
    done
fi
exec cat > "$last"
"#;

fn install_fake_ffmpeg(dir: &Path) -> String {
    let path = dir.join("ffmpeg");
    fs::write(&path, FAKE_FFMPEG).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path.display().to_string()
}

#[test]
fn records_rotating_files_and_serves_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let ffmpeg = install_fake_ffmpeg(dir.path());
    let out = dir.path().join("rec");
    let config = Config::from_toml(&format!(
        r#"
        [pipeline]
        ffmpeg = "{ffmpeg}"
        pop_timeout_ms = 100
        restart_backoff_ms = 20
        first_frame_timeout_secs = 5
        shutdown_timeout_secs = 5

        [[sources]]
        name = "front"
        input = "testsrc"
        width = 4
        height = 4

        [[recorders]]
        name = "front-rec"
        source = "front"
        period_secs = 1
        fps = 10
        target_pattern = "{out}/front-{{sequence:03}}.raw"

        [viewer]
        port = 0
        "#,
        out = out.display(),
    ))
    .unwrap();

    let stats = Arc::new(MemoryStats::new());
    let mut pipeline = Pipeline::build(&config, stats.clone()).unwrap();
    pipeline.start().unwrap();
    assert!(pipeline.readers()[0].frames() > 0);

    let addr = pipeline.viewer_addr().unwrap();
    let snapshot = get(addr, "/capture/front.png");
    assert_eq!(snapshot.status, 200);

    assert!(eventually(Duration::from_secs(10), || pipeline.recorders()[0].files() >= 2));
    thread::sleep(Duration::from_millis(200));
    assert!(pipeline.shutdown().is_empty());

    let first = fs::metadata(out.join("front-001.raw")).unwrap().len();
    assert!(first > 0);
    assert_eq!(first % 48, 0);
    assert!(out.join("front-002.raw").exists());
    assert!(stats.timings("capture.front.frame") > 0);
    assert!(stats.counter("store.front-rec.rotate") >= 1);
}
