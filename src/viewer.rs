//! HTTP snapshot server.
//!
//! Serves the latest frame of each viewer queue as a still image:
//!
//! - `GET /` lists the sources with inline snapshots
//! - `GET /capture/<source>.<png|jpg>?scale=<n|a/b|x.y>` returns one image
//!
//! With `auth` set every request needs matching HTTP Basic credentials.
//! Snapshots are gzipped for clients that accept it.
//!
//! Frames are only peeked, never popped, so the viewer cannot take frames
//! away from recorders. Give viewer queues a capacity of 1 so the peeked
//! frame is always the newest one.

use std::collections::BTreeMap;
use std::io::Write;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;
use image::ImageFormat;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::capture::Frame;
use crate::error::Result;
use crate::pipeline::queue::Delivery;
use crate::pipeline::service::{Completion, Service, StopToken, Worker};
use crate::pipeline::FrameQueue;
use crate::stats::SharedStats;

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);
const MAX_SCALE: f64 = 4.0;

/// Characters left as-is in a source name used as a path segment.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

#[derive(Debug, Clone)]
pub struct ViewerSettings {
    pub name: String,
    pub addr: SocketAddr,
    /// How long a request waits for a frame before answering 503
    pub peek_timeout: Duration,
    /// `user:password` required through HTTP Basic auth
    pub auth: Option<String>,
}

pub struct Viewer {
    settings: ViewerSettings,
    queues: Arc<BTreeMap<String, Arc<FrameQueue>>>,
    stats: SharedStats,
    local_addr: Option<SocketAddr>,
    worker: Worker,
}

impl Viewer {
    pub fn new(
        settings: ViewerSettings,
        queues: BTreeMap<String, Arc<FrameQueue>>,
        stats: SharedStats,
    ) -> Self {
        let worker = Worker::new(format!("viewer-{}", settings.name));
        Self {
            settings,
            queues: Arc::new(queues),
            stats,
            local_addr: None,
            worker,
        }
    }

    /// Address actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Service for Viewer {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn start(&mut self) -> Result<()> {
        // Bind up front so address problems surface to the caller
        let listener = TcpListener::bind(self.settings.addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let state = ViewerState {
            keys: Arc::new(ViewerKeys::new(&self.settings.name)),
            queues: Arc::clone(&self.queues),
            stats: Arc::clone(&self.stats),
            peek_timeout: self.settings.peek_timeout,
            credentials: self.settings.auth.as_deref().map(basic_credentials).map(Arc::from),
            challenge: Arc::from(format!("Basic realm=\"{}\"", self.settings.name)),
        };
        let name = self.settings.name.clone();
        self.worker.spawn(move |token| serve(name, listener, state, token))?;
        self.local_addr = Some(local_addr);
        info!(viewer = %self.settings.name, %local_addr, "viewer listening");
        Ok(())
    }

    fn stop(&self) {
        self.worker.stop();
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Completion {
        self.worker.wait(timeout)
    }
}

struct ViewerKeys {
    response: String,
    scale: String,
    format: String,
    compress: String,
    unavailable: String,
    unauthorized: String,
}

impl ViewerKeys {
    fn new(name: &str) -> Self {
        Self {
            response: format!("viewer.{name}.response"),
            scale: format!("viewer.{name}.scale"),
            format: format!("viewer.{name}.format"),
            compress: format!("viewer.{name}.compress"),
            unavailable: format!("viewer.{name}.unavailable"),
            unauthorized: format!("viewer.{name}.unauthorized"),
        }
    }
}

#[derive(Clone)]
struct ViewerState {
    keys: Arc<ViewerKeys>,
    queues: Arc<BTreeMap<String, Arc<FrameQueue>>>,
    stats: SharedStats,
    peek_timeout: Duration,
    /// Expected `Authorization` header value
    credentials: Option<Arc<str>>,
    challenge: Arc<str>,
}

#[derive(Debug, Deserialize)]
struct SnapshotParams {
    scale: Option<String>,
}

fn serve(name: String, listener: TcpListener, state: ViewerState, token: StopToken) {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name(format!("viewer-{name}-rt"))
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(viewer = %name, "failed to build runtime: {e}");
            return;
        }
    };

    let served = runtime.block_on(async move {
        let listener = tokio::net::TcpListener::from_std(listener)?;
        let app = Router::new()
            .route("/", get(index))
            .route("/index.html", get(index))
            .route("/capture/:file", get(snapshot))
            .layer(middleware::from_fn_with_state(state.clone(), require_auth))
            .with_state(state);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while token.is_running() {
                    tokio::time::sleep(SHUTDOWN_POLL).await;
                }
            })
            .await
    });
    match served {
        Ok(()) => info!(viewer = %name, "viewer terminated"),
        Err(e) => error!(viewer = %name, "viewer failed: {e}"),
    }
}

fn basic_credentials(auth: &str) -> String {
    format!("Basic {}", STANDARD.encode(auth))
}

async fn require_auth(State(state): State<ViewerState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.credentials.as_deref() else {
        return next.run(request).await;
    };
    let given = request.headers().get(header::AUTHORIZATION).map(HeaderValue::as_bytes);
    if given == Some(expected.as_bytes()) {
        return next.run(request).await;
    }
    state.stats.incr(&state.keys.unauthorized, 1);
    debug!(uri = %request.uri(), "rejected unauthenticated request");
    (StatusCode::UNAUTHORIZED, [(header::WWW_AUTHENTICATE, state.challenge.to_string())]).into_response()
}

async fn index(State(state): State<ViewerState>) -> Html<String> {
    let mut body = String::from(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>vigil</title></head><body>\n",
    );
    for source in state.queues.keys() {
        let title = escape_html(source);
        let link = utf8_percent_encode(source, SEGMENT);
        body.push_str(&format!(
            "<section><h2>{title}</h2><a href=\"/capture/{link}.png\"><img src=\"/capture/{link}.jpg?scale=1/2\" alt=\"{title}\"></a></section>\n"
        ));
    }
    body.push_str("</body></html>\n");
    Html(body)
}

async fn snapshot(
    State(state): State<ViewerState>,
    Path(file): Path<String>,
    Query(params): Query<SnapshotParams>,
    headers: HeaderMap,
) -> Response {
    let started = Instant::now();
    let Some((source, ext)) = file.rsplit_once('.') else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(format) = image_format(ext) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(queue) = state.queues.get(source).cloned() else {
        return (StatusCode::NOT_FOUND, format!("unknown source '{source}'")).into_response();
    };
    let scale = match params.scale.as_deref() {
        None => 1.0,
        Some(raw) => match parse_scale(raw) {
            Some(scale) => scale,
            None => return (StatusCode::BAD_REQUEST, format!("invalid scale '{raw}'")).into_response(),
        },
    };

    let gzip = accepts_gzip(&headers);
    let render_state = state.clone();
    let rendered = tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>> {
        let bytes = render_snapshot(&render_state, &queue, format, scale)?;
        match bytes {
            Some(bytes) if gzip => {
                let started = Instant::now();
                let compressed = compress(&bytes)?;
                render_state.stats.timing(&render_state.keys.compress, started.elapsed());
                Ok(Some(compressed))
            }
            bytes => Ok(bytes),
        }
    })
    .await;
    let response = match rendered {
        Ok(Ok(Some(bytes))) => {
            let mut response = ([(header::CONTENT_TYPE, format.to_mime_type())], bytes).into_response();
            let headers = response.headers_mut();
            headers.insert(header::VARY, HeaderValue::from_static("accept-encoding"));
            if gzip {
                headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            }
            response
        }
        Ok(Ok(None)) => {
            state.stats.incr(&state.keys.unavailable, 1);
            (StatusCode::SERVICE_UNAVAILABLE, "no frame available").into_response()
        }
        Ok(Err(e)) => {
            warn!(source, "snapshot failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(e) => {
            error!(source, "snapshot task failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    };
    state.stats.timing(&state.keys.response, started.elapsed());
    response
}

fn render_snapshot(
    state: &ViewerState,
    queue: &FrameQueue,
    format: ImageFormat,
    scale: f64,
) -> Result<Option<Vec<u8>>> {
    let Delivery::Delivered(frame) = queue.peek(Some(state.peek_timeout)) else {
        return Ok(None);
    };

    let resized: Frame;
    let frame: &Frame = if (scale - 1.0).abs() > f64::EPSILON {
        let started = Instant::now();
        let shape = frame.shape();
        let width = (f64::from(shape.width) * scale).round() as u32;
        let height = (f64::from(shape.height) * scale).round() as u32;
        resized = frame.resize(width, height)?;
        state.stats.timing(&state.keys.scale, started.elapsed());
        &resized
    } else {
        &frame
    };

    let started = Instant::now();
    let bytes = frame.encode(format)?;
    state.stats.timing(&state.keys.format, started.elapsed());
    debug!(queue = queue.name(), bytes = bytes.len(), "snapshot encoded");
    Ok(Some(bytes))
}

/// Whether `Accept-Encoding` lists gzip without a zero weight.
fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|coding| {
            let mut parts = coding.split(';').map(str::trim);
            let name = parts.next().unwrap_or_default();
            let refused = parts.any(|param| {
                param
                    .strip_prefix("q=")
                    .and_then(|q| q.parse::<f32>().ok())
                    .is_some_and(|q| q <= 0.0)
            });
            name.eq_ignore_ascii_case("gzip") && !refused
        })
}

fn compress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

fn image_format(ext: &str) -> Option<ImageFormat> {
    match ext {
        "png" => Some(ImageFormat::Png),
        "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
        _ => None,
    }
}

/// Accepts `2`, `1/2` or `0.5`; the result must lie in `(0, MAX_SCALE]`.
fn parse_scale(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let value = match raw.split_once('/') {
        Some((num, den)) => {
            let num: u32 = num.trim().parse().ok()?;
            let den: u32 = den.trim().parse().ok()?;
            if den == 0 {
                return None;
            }
            f64::from(num) / f64::from(den)
        }
        None => raw.parse::<f64>().ok()?,
    };
    (value.is_finite() && value > 0.0 && value <= MAX_SCALE).then_some(value)
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_forms() {
        assert_eq!(parse_scale("1"), Some(1.0));
        assert_eq!(parse_scale("1/2"), Some(0.5));
        assert_eq!(parse_scale(" 0.25 "), Some(0.25));
        assert_eq!(parse_scale("3/0"), None);
        assert_eq!(parse_scale("0"), None);
        assert_eq!(parse_scale("-1"), None);
        assert_eq!(parse_scale("10"), None);
        assert_eq!(parse_scale("half"), None);
    }

    #[test]
    fn image_extensions() {
        assert_eq!(image_format("png"), Some(ImageFormat::Png));
        assert_eq!(image_format("jpeg"), Some(ImageFormat::Jpeg));
        assert_eq!(image_format("gif"), None);
    }

    #[test]
    fn gzip_negotiation() {
        let accepting = |value: &'static str| {
            let mut headers = HeaderMap::new();
            headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static(value));
            accepts_gzip(&headers)
        };
        assert!(accepting("gzip"));
        assert!(accepting("deflate, GZIP;q=0.8"));
        assert!(!accepting("gzip;q=0"));
        assert!(!accepting("br, deflate"));
        assert!(!accepting("x-gzip-ish"));
        assert!(!accepts_gzip(&HeaderMap::new()));
    }

    #[test]
    fn compressed_snapshot_inflates_back() {
        use std::io::Read;

        let data = vec![42u8; 4096];
        let packed = compress(&data).unwrap();
        assert!(packed.len() < data.len());
        let mut unpacked = Vec::new();
        flate2::read::GzDecoder::new(packed.as_slice())
            .read_to_end(&mut unpacked)
            .unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn basic_credentials_header() {
        assert_eq!(basic_credentials("admin:secret"), "Basic YWRtaW46c2VjcmV0");
    }

    #[test]
    fn source_links_are_percent_encoded() {
        assert_eq!(utf8_percent_encode("side cam", SEGMENT).to_string(), "side%20cam");
        assert_eq!(utf8_percent_encode("a/b?c#d", SEGMENT).to_string(), "a%2Fb%3Fc%23d");
        assert_eq!(utf8_percent_encode("front-1_v2.x~", SEGMENT).to_string(), "front-1_v2.x~");
        assert_eq!(utf8_percent_encode("câmera", SEGMENT).to_string(), "c%C3%A2mera");
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(escape_html("a<b>&\"c\""), "a&lt;b&gt;&amp;&quot;c&quot;");
    }
}
