#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use vigil::capture::{Backoff, Reader, ReaderConfig};
use vigil::pipeline::{FrameQueue, Service};
use vigil::stats::MemoryStats;

use common::{eventually, shape, ShellCapture};

fn reader(script: &'static str, queue: Arc<FrameQueue>, stats: Arc<MemoryStats>) -> Reader {
    Reader::new(
        ReaderConfig {
            name: "cam".into(),
            shape: shape(),
            backoff: Backoff {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(50),
            },
        },
        Arc::new(ShellCapture(script)),
        queue,
        stats,
    )
}

#[test]
fn respawns_capture_process_after_exit() {
    let stats = Arc::new(MemoryStats::new());
    let queue = Arc::new(FrameQueue::new("cam", 4, stats.clone()).unwrap());
    // Two 4x4 RGB frames, then exit
    let mut reader = reader("head -c 96 /dev/zero", Arc::clone(&queue), stats.clone());

    reader.start().unwrap();
    reader.wait_first_frame(Some(Duration::from_secs(5))).unwrap();
    assert!(
        eventually(Duration::from_secs(10), || reader.frames() >= 6),
        "only {} frames",
        reader.frames()
    );
    assert!(stats.counter("capture.cam.restart") >= 2);

    let frame = queue.pop(Some(Duration::from_secs(1))).into_option().unwrap();
    assert_eq!(frame.shape(), shape());
    assert!(frame.data().iter().all(|&b| b == 0));

    reader.stop();
    reader.wait_finish(Some(Duration::from_secs(5))).unwrap();
}

#[test]
fn queue_keeps_only_the_newest_frames() {
    let stats = Arc::new(MemoryStats::new());
    let queue = Arc::new(FrameQueue::new("cam", 2, stats.clone()).unwrap());
    let mut reader = reader("head -c 480 /dev/zero; exec sleep 30", Arc::clone(&queue), stats.clone());

    reader.start().unwrap();
    assert!(eventually(Duration::from_secs(5), || reader.frames() == 10));
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.counters().evicted, 8);

    reader.stop();
    reader.wait_finish(Some(Duration::from_secs(5))).unwrap();
}

#[test]
fn stop_interrupts_a_stalled_source() {
    let stats = Arc::new(MemoryStats::new());
    let queue = Arc::new(FrameQueue::new("cam", 2, stats.clone()).unwrap());
    let mut reader = reader("exec sleep 30", queue, stats);

    reader.start().unwrap();
    assert!(reader.wait_first_frame(Some(Duration::from_millis(200))).is_err());

    let started = Instant::now();
    reader.stop();
    reader.wait_finish(Some(Duration::from_secs(5))).unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(reader.frames(), 0);
}
