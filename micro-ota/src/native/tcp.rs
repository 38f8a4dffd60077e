//! TCP and TLS transport streams for hosts with an OS network stack.

use std::io::BufReader;
use std::mem::MaybeUninit;
use std::net::TcpStream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_io::Async;
use futures_lite::future::FutureExt;
use futures_lite::{ready, AsyncRead, AsyncWrite, Future};
use futures_rustls::TlsConnector;
use hyper::{rt, Uri};
use rustls::{ClientConfig, KeyLogFile, OwnedTrustAnchor, RootCertStore};

use crate::common::transport::{IntoTransportStream, TransportConnector, TransportStream};

/// Connector over the host network stack. `http` URIs get a plain TCP
/// stream, `https` URIs a TLS session negotiating h2.
#[derive(Default)]
pub struct NativeConnector {
    trust_anchor: Option<Vec<u8>>,
}

impl NativeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn client_config(&self) -> Result<ClientConfig, std::io::Error> {
        let mut roots = RootCertStore::empty();
        match self.trust_anchor.as_ref() {
            Some(pem) => {
                for cert in rustls_pemfile::certs(&mut BufReader::new(pem.as_slice())) {
                    let cert = cert?;
                    roots
                        .add(&rustls::Certificate(cert.to_vec()))
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                }
            }
            None => {
                roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
                    OwnedTrustAnchor::from_subject_spki_name_constraints(
                        ta.subject,
                        ta.spki,
                        ta.name_constraints,
                    )
                }));
            }
        }
        let mut cfg = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();
        cfg.key_log = Arc::new(KeyLogFile::new());
        cfg.alpn_protocols = vec!["h2".as_bytes().to_vec()];
        Ok(cfg)
    }
}

fn invalid_uri(what: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, what.to_owned())
}

impl TransportConnector for NativeConnector {
    fn set_trust_anchor(&mut self, pem: Vec<u8>) {
        let _ = self.trust_anchor.replace(pem);
    }

    fn connect_to(&self, uri: &Uri) -> Result<Pin<Box<dyn IntoTransportStream>>, std::io::Error> {
        let authority = uri
            .authority()
            .ok_or_else(|| invalid_uri("uri missing authority"))?;
        let stream = Async::new(TcpStream::connect(authority.as_str())?)?;
        if uri.scheme_str().is_some_and(|s| s == "http") {
            log::info!("insecurely connecting to {}", uri);
            return Ok(Box::pin(PlainStreamConnector(Some(stream))));
        }
        let host = uri.host().ok_or_else(|| invalid_uri("uri missing host"))?;
        let server_name: rustls::ServerName = host
            .try_into()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let connector = TlsConnector::from(Arc::new(self.client_config()?));
        Ok(Box::pin(TlsStreamConnector(
            connector.connect(server_name, stream),
        )))
    }
}

pub struct TlsStreamConnector(futures_rustls::Connect<Async<TcpStream>>);
impl IntoTransportStream for TlsStreamConnector {}

impl Future for TlsStreamConnector {
    type Output = Result<Box<dyn TransportStream>, std::io::Error>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result: Self::Output = ready!(self.0.poll(cx))
            .map(|s| Box::new(NativeStream::Tls(s.into())) as Box<dyn TransportStream>);
        Poll::Ready(result)
    }
}

pub struct PlainStreamConnector(Option<Async<TcpStream>>);
impl IntoTransportStream for PlainStreamConnector {}

impl Future for PlainStreamConnector {
    type Output = Result<Box<dyn TransportStream>, std::io::Error>;
    fn poll(mut self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Self::Output> {
        Poll::Ready(Ok(Box::new(NativeStream::Plain(self.0.take().unwrap()))))
    }
}

/// A plain or encrypted TCP stream behind hyper's I/O traits.
pub enum NativeStream {
    Plain(Async<TcpStream>),
    Tls(futures_rustls::TlsStream<Async<TcpStream>>),
}

impl rt::Read for NativeStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        mut buf: rt::ReadBufCursor<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        let uninit_buf = unsafe { &mut *(buf.as_mut() as *mut [MaybeUninit<u8>] as *mut [u8]) };
        let nread = match &mut *self {
            NativeStream::Plain(s) => {
                futures_lite::pin!(s);
                ready!(s.poll_read(cx, uninit_buf))
            }
            NativeStream::Tls(s) => {
                futures_lite::pin!(s);
                ready!(s.poll_read(cx, uninit_buf))
            }
        };
        match nread {
            Ok(n) => {
                unsafe { buf.advance(n) };
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl rt::Write for NativeStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match &mut *self {
            NativeStream::Plain(s) => {
                futures_lite::pin!(s);
                s.poll_write(cx, buf)
            }
            NativeStream::Tls(s) => {
                futures_lite::pin!(s);
                s.poll_write(cx, buf)
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match &mut *self {
            NativeStream::Plain(s) => {
                futures_lite::pin!(s);
                s.poll_flush(cx)
            }
            NativeStream::Tls(s) => {
                futures_lite::pin!(s);
                s.poll_flush(cx)
            }
        }
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match &mut *self {
            NativeStream::Plain(s) => {
                futures_lite::pin!(s);
                s.poll_close(cx)
            }
            NativeStream::Tls(s) => {
                futures_lite::pin!(s);
                s.poll_close(cx)
            }
        }
    }
}
