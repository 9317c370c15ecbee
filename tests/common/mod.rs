#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

use vigil::ffmpeg::{CaptureProgram, EncodeProgram};
use vigil::Shape;

/// Capture program running a shell script, whatever the shape.
pub struct ShellCapture(pub &'static str);

impl CaptureProgram for ShellCapture {
    fn command(&self, _shape: Shape) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", self.0]);
        cmd
    }
}

/// Encoder that stores the raw input verbatim.
pub struct CatEncoder;

impl EncodeProgram for CatEncoder {
    fn command(&self, _shape: Shape, _fps: u32, target: &Path) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "cat > \"$0\""]).arg(target);
        cmd
    }
}

/// Encoder that exits at once without reading its input.
pub struct DeadEncoder;

impl EncodeProgram for DeadEncoder {
    fn command(&self, _shape: Shape, _fps: u32, _target: &Path) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exit 3"]);
        cmd
    }
}

pub fn shape() -> Shape {
    Shape::new(4, 4, 3).unwrap()
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    cond()
}

pub struct HttpResponse {
    pub status: u16,
    pub headers: String,
    pub body: Vec<u8>,
}

/// Minimal HTTP/1.1 GET over a fresh connection.
pub fn get(addr: SocketAddr, path: &str) -> HttpResponse {
    get_with(addr, path, &[])
}

/// GET with extra request headers.
pub fn get_with(addr: SocketAddr, path: &str, headers: &[(&str, &str)]) -> HttpResponse {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let mut request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response has no header terminator");
    let headers = String::from_utf8_lossy(&raw[..split]).into_owned();
    let status = headers
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("malformed status line");
    HttpResponse {
        status,
        headers,
        body: raw[split + 4..].to_vec(),
    }
}

impl HttpResponse {
    /// Value of the first header called `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
        })
    }
}
