//! In-process HTTP server for tests, serving one fixed resource.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

type Body = UnsyncBoxBody<Bytes, Infallible>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    /// Honors `Range` headers with 206 responses.
    Ranges,
    /// Always answers 200 with the full body.
    NoRanges,
    /// Answers the `bytes=0-0` probe with 206 but ignores every other range.
    ProbeOnlyRanges,
    /// Honors ranges but answers 500 to the segment starting at this offset.
    FailSegment(u64),
    /// Honors ranges but sends only half of the segment starting at this
    /// offset, chunked so the client cannot tell from the headers.
    ShortSegment(u64),
    NotFound,
}

struct Shared {
    data: Bytes,
    mode: ServerMode,
    throttle: Option<(usize, Duration)>,
    ranges_seen: Mutex<Vec<Option<String>>>,
}

pub struct TestServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(data: Vec<u8>, mode: ServerMode) -> Self {
        Self::start_inner(data, mode, None).await
    }

    /// Streams bodies `chunk` bytes at a time with `delay` between chunks.
    pub async fn start_throttled(
        data: Vec<u8>,
        mode: ServerMode,
        chunk: usize,
        delay: Duration,
    ) -> Self {
        Self::start_inner(data, mode, Some((chunk, delay))).await
    }

    async fn start_inner(
        data: Vec<u8>,
        mode: ServerMode,
        throttle: Option<(usize, Duration)>,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            data: Bytes::from(data),
            mode,
            throttle,
            ranges_seen: Mutex::new(Vec::new()),
        });

        let server_shared = shared.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let shared = server_shared.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(socket);
                    let service = service_fn(move |req| {
                        let shared = shared.clone();
                        async move { Ok::<_, Infallible>(respond(req, &shared)) }
                    });
                    let _ = http1::Builder::new().serve_connection(io, service).await;
                });
            }
        });

        Self {
            addr,
            shared,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}/files/payload.bin", self.addr)
    }

    /// `Range` headers of every request received so far, in arrival order.
    pub fn ranges_seen(&self) -> Vec<Option<String>> {
        self.shared.ranges_seen.lock().unwrap().clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn respond(req: Request<Incoming>, shared: &Shared) -> Response<Body> {
    let range = req
        .headers()
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    shared.ranges_seen.lock().unwrap().push(range.clone());

    let len = shared.data.len() as u64;
    let honor_range = match shared.mode {
        ServerMode::NotFound => {
            return Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(full(Bytes::new()))
                .unwrap();
        }
        ServerMode::Ranges | ServerMode::FailSegment(_) | ServerMode::ShortSegment(_) => true,
        ServerMode::ProbeOnlyRanges => range.as_deref() == Some("bytes=0-0"),
        ServerMode::NoRanges => false,
    };

    let parsed = range.as_deref().and_then(parse_range);
    match (honor_range, parsed) {
        (true, Some((start, end))) => {
            if start >= len {
                return Response::builder()
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(header::CONTENT_RANGE, format!("bytes */{}", len))
                    .body(full(Bytes::new()))
                    .unwrap();
            }
            let end = end.unwrap_or(len - 1).min(len - 1);
            let slice = shared.data.slice(start as usize..=end as usize);
            let is_probe = range.as_deref() == Some("bytes=0-0");
            match shared.mode {
                ServerMode::FailSegment(at) if at == start && !is_probe => {
                    return Response::builder()
                        .status(StatusCode::INTERNAL_SERVER_ERROR)
                        .body(full(Bytes::new()))
                        .unwrap();
                }
                ServerMode::ShortSegment(at) if at == start && !is_probe => {
                    let half = slice.slice(..slice.len() / 2);
                    return Response::builder()
                        .status(StatusCode::PARTIAL_CONTENT)
                        .header(header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, len))
                        .body(chunked(half))
                        .unwrap();
                }
                _ => {}
            }
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, len))
                .header(header::CONTENT_LENGTH, slice.len())
                .body(body(slice, shared.throttle))
                .unwrap()
        }
        _ => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, len)
            .body(body(shared.data.clone(), shared.throttle))
            .unwrap(),
    }
}

fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.parse().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse().ok()?)
    };
    Some((start, end))
}

fn full(data: Bytes) -> Body {
    Full::new(data).boxed_unsync()
}

/// Single-frame streaming body; no size hint, so hyper uses chunked encoding.
fn chunked(data: Bytes) -> Body {
    let frames = futures::stream::iter([Ok::<_, Infallible>(Frame::data(data))]);
    StreamBody::new(frames).boxed_unsync()
}

fn body(data: Bytes, throttle: Option<(usize, Duration)>) -> Body {
    let Some((chunk, delay)) = throttle else {
        return full(data);
    };
    let chunks: Vec<Bytes> = data
        .chunks(chunk.max(1))
        .map(Bytes::copy_from_slice)
        .collect();
    let stream = futures::stream::iter(chunks).then(move |c| async move {
        tokio::time::sleep(delay).await;
        Ok::<_, Infallible>(Frame::data(c))
    });
    StreamBody::new(stream).boxed_unsync()
}

/// Deterministic non-repeating payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(2_654_435_761).to_le_bytes()[1])
        .collect()
}
