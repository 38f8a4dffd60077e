//! Fetch contracts between the update state machine and the firmware server,
//! and their HTTP/2 implementation.
//!
//! Two endpoints exist: `/info` answers with the staged image filename (empty
//! when there is nothing to offer) and `/static/{filename}` serves the image
//! itself. Images are pulled through consecutive `Range` requests so a
//! download can resume from the last confirmed byte, and body frames are
//! surfaced incrementally so no image is ever buffered whole.

use std::pin::Pin;
use std::time::Instant;

use async_io::Timer;
use bytes::{Bytes, BytesMut};
use futures_lite::{ready, Future};
use http_body_util::{BodyExt, Empty};
use hyper::{
    body::Incoming,
    client::conn::http2::{self, SendRequest},
    header,
    header::HeaderMap,
    http::status::StatusCode,
    rt::{self, Sleep},
    Request, Uri,
};
use thiserror::Error;

use crate::common::{config::ConfigError, config::UpdateConfig, exec::Executor};

/// upper bound on an `/info` body
pub const INFO_MAX_LEN: usize = 256;

// a server answering ranged requests with empty bodies gets this many chances
const MAX_EMPTY_RESPONSES: u32 = 2;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Hyper(#[from] hyper::Error),
    #[error(transparent)]
    Http(#[from] hyper::http::Error),
    #[error("http request error {0}")]
    HttpStatus(StatusCode),
    #[error("response missing content length")]
    MissingContentLength,
    #[error("response missing content range")]
    MissingContentRange,
    #[error("unparsable content range `{0}`")]
    BadContentRange(String),
    #[error("server cannot resume a partial download")]
    RangeNotSupported,
    #[error("requested range at {requested}, server answered at {got}")]
    RangeMismatch { requested: usize, got: usize },
    #[error("image size changed mid download: was {was}, now {now}")]
    SizeChanged { was: usize, now: usize },
    #[error("server sent more bytes than the declared {declared}")]
    TooManyBytes { declared: usize },
    #[error("download contained non-data frame")]
    UnexpectedFrame,
    #[error("update info response exceeded {INFO_MAX_LEN} bytes")]
    InfoTooLarge,
    #[error("update info is not valid utf-8")]
    InfoNotUtf8,
    #[error("no data received within {0:?}")]
    Timeout(std::time::Duration),
}

/// Dials the firmware server and hands back something hyper can drive.
pub trait TransportConnector {
    /// if not called, https connections verify against the platform roots
    fn set_trust_anchor(&mut self, pem: Vec<u8>);
    fn connect_to(
        &self,
        uri: &Uri,
    ) -> Result<Pin<Box<dyn IntoTransportStream>>, std::io::Error>;
}

pub trait TransportStream: rt::Read + rt::Write + Unpin {}
pub trait IntoTransportStream:
    Future<Output = Result<Box<dyn TransportStream>, std::io::Error>>
{
}

impl<T> TransportStream for T where T: rt::Read + rt::Write + Unpin {}

/// Client side of the two firmware endpoints.
pub trait UpdateTransport {
    type Download: ImageDownload;
    /// `GET /info`; `None` when the body is empty, meaning no update is
    /// staged.
    fn fetch_update_info(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, TransportError>> + '_>>;
    /// Opens `GET /static/{filename}` at the given byte offset. Bytes before
    /// `resume_from` are never requested again.
    fn open_download(
        &mut self,
        filename: String,
        resume_from: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Download, TransportError>> + '_>>;
}

/// One image download in flight.
///
/// `next_frame` yields raw body bytes in arrival order and `None` once the
/// server has nothing more to give. `is_complete` is deliberately distinct
/// from "no error": a server that closes early terminates the stream cleanly
/// with `bytes_received() < total_size()`.
pub trait ImageDownload {
    fn next_frame(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Bytes>, TransportError>> + '_>>;
    /// declared image size, known once the first response arrived
    fn total_size(&self) -> Option<usize>;
    fn bytes_received(&self) -> usize;
    fn is_complete(&self) -> bool;
}

struct AsyncioSleep(Timer);

impl Sleep for AsyncioSleep {}

impl AsyncioSleep {
    fn reset(mut self: Pin<&mut Self>, deadline: Instant) {
        self.0.set_at(deadline)
    }
}

impl Future for AsyncioSleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<()> {
        let _ = ready!(Pin::new(&mut self.0).poll(cx));
        std::task::Poll::Ready(())
    }
}

#[derive(Default, Clone, Debug)]
pub(crate) struct H2Timer;

impl rt::Timer for H2Timer {
    fn sleep(&self, duration: std::time::Duration) -> Pin<Box<dyn Sleep>> {
        Box::pin(AsyncioSleep(Timer::after(duration)))
    }
    fn sleep_until(&self, deadline: Instant) -> Pin<Box<dyn Sleep>> {
        Box::pin(AsyncioSleep(Timer::at(deadline)))
    }
    fn reset(&self, sleep: &mut Pin<Box<dyn Sleep>>, new_deadline: Instant) {
        if let Some(timer) = sleep.as_mut().downcast_mut_pin::<AsyncioSleep>() {
            timer.reset(new_deadline)
        }
    }
}

/// HTTP/2 implementation of [`UpdateTransport`]. Each poll opens a fresh
/// connection; all chunk requests of one download multiplex over a single
/// connection.
pub struct HttpTransport<C: TransportConnector> {
    exec: Executor,
    connector: C,
    config: UpdateConfig,
}

impl<C: TransportConnector> HttpTransport<C> {
    pub fn new(exec: Executor, mut connector: C, config: UpdateConfig) -> Self {
        if let Some(pem) = config.trust_anchor() {
            connector.set_trust_anchor(pem.to_vec());
        }
        Self {
            exec,
            connector,
            config,
        }
    }

    async fn connect(
        &self,
        uri: &Uri,
    ) -> Result<(SendRequest<Empty<Bytes>>, async_executor::Task<()>), TransportError> {
        let io = self.connector.connect_to(uri)?.await?;
        let (sender, conn) = http2::Builder::new(self.exec.clone())
            .max_frame_size(16_384) // lowest configurable value
            .timer(H2Timer)
            .handshake(io)
            .await?;
        let conn_task = self.exec.spawn(async move {
            if let Err(e) = conn.await {
                log::error!("transport connection failed: {:?}", e);
            }
        });
        Ok((sender, conn_task))
    }

    async fn fetch_info_inner(&self) -> Result<Option<String>, TransportError> {
        let uri = self.config.info_uri()?;
        let (mut sender, _conn) = self.connect(&uri).await?;
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .header(header::USER_AGENT, "micro-ota")
            .body(Empty::<Bytes>::new())?;
        let mut response = sender.send_request(request).await?;
        if response.status() != StatusCode::OK {
            return Err(TransportError::HttpStatus(response.status()));
        }
        let mut buf = BytesMut::new();
        while let Some(next) = response.frame().await {
            let frame = next?;
            if let Ok(data) = frame.into_data() {
                if buf.len() + data.len() > INFO_MAX_LEN {
                    return Err(TransportError::InfoTooLarge);
                }
                buf.extend_from_slice(&data);
            }
        }
        let body =
            String::from_utf8(buf.to_vec()).map_err(|_| TransportError::InfoNotUtf8)?;
        let filename = body.trim();
        if filename.is_empty() {
            return Ok(None);
        }
        Ok(Some(filename.to_owned()))
    }

    async fn open_download_inner(
        &self,
        filename: String,
        resume_from: usize,
    ) -> Result<HttpDownload, TransportError> {
        let uri = self.config.image_uri(&filename)?;
        let (sender, conn_task) = self.connect(&uri).await?;
        let mut download = HttpDownload {
            sender,
            _conn: conn_task,
            uri,
            cursor: resume_from,
            total: None,
            max_request: self.config.max_http_request_size(),
            response: None,
            ranged: false,
            response_bytes: 0,
            empty_responses: 0,
            done: false,
        };
        download.request_next_range().await?;
        Ok(download)
    }
}

impl<C: TransportConnector> UpdateTransport for HttpTransport<C> {
    type Download = HttpDownload;

    fn fetch_update_info(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, TransportError>> + '_>> {
        Box::pin(self.fetch_info_inner())
    }

    fn open_download(
        &mut self,
        filename: String,
        resume_from: usize,
    ) -> Pin<Box<dyn Future<Output = Result<HttpDownload, TransportError>> + '_>> {
        Box::pin(self.open_download_inner(filename, resume_from))
    }
}

/// Ranged image download over one HTTP/2 connection.
pub struct HttpDownload {
    sender: SendRequest<Empty<Bytes>>,
    _conn: async_executor::Task<()>,
    uri: Uri,
    cursor: usize,
    total: Option<usize>,
    max_request: usize,
    response: Option<Incoming>,
    ranged: bool,
    response_bytes: usize,
    empty_responses: u32,
    done: bool,
}

impl HttpDownload {
    async fn request_next_range(&mut self) -> Result<(), TransportError> {
        let end = match self.total {
            Some(total) => (self.cursor + self.max_request).min(total) - 1,
            None => self.cursor + self.max_request - 1,
        };
        let request = Request::builder()
            .method("GET")
            .uri(self.uri.clone())
            .header(header::RANGE, format!("bytes={}-{}", self.cursor, end))
            .header(header::USER_AGENT, "micro-ota")
            .body(Empty::<Bytes>::new())?;
        let response = self.sender.send_request(request).await?;
        match response.status() {
            StatusCode::PARTIAL_CONTENT => {
                let (start, total) = parse_content_range(response.headers())?;
                if start != self.cursor {
                    return Err(TransportError::RangeMismatch {
                        requested: self.cursor,
                        got: start,
                    });
                }
                match self.total {
                    Some(known) if known != total => {
                        return Err(TransportError::SizeChanged {
                            was: known,
                            now: total,
                        })
                    }
                    _ => self.total = Some(total),
                }
                self.ranged = true;
            }
            StatusCode::OK => {
                // the server ignored the range header and restarted the body
                if self.cursor != 0 {
                    return Err(TransportError::RangeNotSupported);
                }
                self.total = Some(content_length(response.headers())?);
                self.ranged = false;
            }
            status => return Err(TransportError::HttpStatus(status)),
        }
        self.response_bytes = 0;
        self.response = Some(response.into_body());
        Ok(())
    }

    async fn next_frame_inner(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            if self.done {
                return Ok(None);
            }
            let body = match self.response.as_mut() {
                Some(body) => body,
                None => {
                    self.done = true;
                    return Ok(None);
                }
            };
            match body.frame().await {
                Some(Ok(frame)) => {
                    let data = frame
                        .into_data()
                        .map_err(|_| TransportError::UnexpectedFrame)?;
                    if data.is_empty() {
                        continue;
                    }
                    if let Some(total) = self.total {
                        if self.cursor + data.len() > total {
                            return Err(TransportError::TooManyBytes { declared: total });
                        }
                    }
                    self.cursor += data.len();
                    self.response_bytes += data.len();
                    return Ok(Some(data));
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    if self.total.map_or(true, |total| self.cursor >= total) {
                        self.done = true;
                        return Ok(None);
                    }
                    if !self.ranged {
                        // a single-response server already gave all it had
                        self.done = true;
                        return Ok(None);
                    }
                    if self.response_bytes == 0 {
                        self.empty_responses += 1;
                        if self.empty_responses >= MAX_EMPTY_RESPONSES {
                            log::error!(
                                "server repeatedly answered with no data at offset {}",
                                self.cursor
                            );
                            self.done = true;
                            return Ok(None);
                        }
                    } else {
                        self.empty_responses = 0;
                    }
                    self.request_next_range().await?;
                }
            }
        }
    }
}

impl ImageDownload for HttpDownload {
    fn next_frame(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Bytes>, TransportError>> + '_>> {
        Box::pin(self.next_frame_inner())
    }

    fn total_size(&self) -> Option<usize> {
        self.total
    }

    fn bytes_received(&self) -> usize {
        self.cursor
    }

    fn is_complete(&self) -> bool {
        self.total.is_some_and(|total| self.cursor == total)
    }
}

fn content_length(headers: &HeaderMap) -> Result<usize, TransportError> {
    headers
        .get(header::CONTENT_LENGTH)
        .ok_or(TransportError::MissingContentLength)?
        .to_str()
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .ok_or(TransportError::MissingContentLength)
}

/// `Content-Range: bytes {start}-{end}/{total}` to `(start, total)`
fn parse_content_range(headers: &HeaderMap) -> Result<(usize, usize), TransportError> {
    let raw = headers
        .get(header::CONTENT_RANGE)
        .ok_or(TransportError::MissingContentRange)?
        .to_str()
        .map_err(|_| TransportError::MissingContentRange)?;
    let bad = || TransportError::BadContentRange(raw.to_owned());
    let rest = raw.strip_prefix("bytes ").ok_or_else(bad)?;
    let (range, total) = rest.split_once('/').ok_or_else(bad)?;
    let (start, _end) = range.split_once('-').ok_or_else(bad)?;
    let start = start.trim().parse::<usize>().map_err(|_| bad())?;
    let total = total.trim().parse::<usize>().map_err(|_| bad())?;
    Ok((start, total))
}
