//! Scripted in-memory doubles for driving update cycles in tests.

use std::cell::RefCell;
use std::pin::Pin;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use futures_lite::{future, Future};

use crate::common::{
    config::UpdateConfig,
    ota::OtaUpdater,
    sched::PauseGate,
    target::InMemorySlot,
    transport::{ImageDownload, TransportError, UpdateTransport},
    version::{build_image, AppDescriptor, FirmwareVersion, VersionStore},
};

pub(crate) const RUNNING_VERSION: &str = "1.2.3";

/// Script for the fake firmware server. Tests keep the `Rc` handle and read
/// call counts back out after the machine ran.
#[derive(Default)]
pub(crate) struct ServerState {
    /// the `/info` answer; `None` plays an empty body
    pub info: Option<String>,
    pub image: Vec<u8>,
    /// bytes handed out per frame; 0 serves everything in one frame
    pub frame_size: usize,
    /// end the stream cleanly at this offset, as a server cut short would
    pub truncate_at: Option<usize>,
    /// break the connection once the cursor reaches this offset
    pub fail_at: Option<usize>,
    /// how many times `fail_at` fires before the server behaves
    pub fail_times: u32,
    /// stop answering (pend forever) once the cursor reaches this offset
    pub stall_at: Option<usize>,
    pub stall_times: u32,
    /// refuse any open that resumes mid image
    pub refuse_resume: bool,
    /// fail this many `/info` calls before answering
    pub info_failures: u32,
    /// overrides the advertised total size
    pub declared_total: Option<usize>,
    /// pause this gate when the cursor crosses the offset, once
    pub pause_at: Option<(usize, PauseGate)>,
    pub info_calls: usize,
    /// resume offset of every open seen, refused ones included
    pub opens: Vec<usize>,
}

impl ServerState {
    fn declared_total(&self) -> usize {
        self.declared_total.unwrap_or(self.image.len())
    }

    fn served_len(&self) -> usize {
        self.truncate_at
            .unwrap_or(self.image.len())
            .min(self.image.len())
    }
}

#[derive(Clone)]
pub(crate) struct FakeTransport(Rc<RefCell<ServerState>>);

impl FakeTransport {
    pub fn new(state: ServerState) -> (Self, Rc<RefCell<ServerState>>) {
        let state = Rc::new(RefCell::new(state));
        (Self(state.clone()), state)
    }
}

impl UpdateTransport for FakeTransport {
    type Download = FakeDownload;

    fn fetch_update_info(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, TransportError>> + '_>> {
        Box::pin(async move {
            let mut state = self.0.borrow_mut();
            state.info_calls += 1;
            if state.info_failures > 0 {
                state.info_failures -= 1;
                return Err(TransportError::HttpStatus(
                    hyper::StatusCode::INTERNAL_SERVER_ERROR,
                ));
            }
            Ok(state.info.clone())
        })
    }

    fn open_download(
        &mut self,
        _filename: String,
        resume_from: usize,
    ) -> Pin<Box<dyn Future<Output = Result<FakeDownload, TransportError>> + '_>> {
        Box::pin(async move {
            let mut state = self.0.borrow_mut();
            state.opens.push(resume_from);
            if state.refuse_resume && resume_from > 0 {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )));
            }
            Ok(FakeDownload {
                state: self.0.clone(),
                cursor: resume_from,
            })
        })
    }
}

enum Served {
    Data(Bytes),
    End,
    Fail,
    Stall,
}

pub(crate) struct FakeDownload {
    state: Rc<RefCell<ServerState>>,
    cursor: usize,
}

impl ImageDownload for FakeDownload {
    fn next_frame(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Bytes>, TransportError>> + '_>> {
        Box::pin(async move {
            // decide under the borrow, act after releasing it
            let served = {
                let mut state = self.state.borrow_mut();
                if state
                    .pause_at
                    .as_ref()
                    .is_some_and(|(offset, _)| self.cursor >= *offset)
                {
                    if let Some((_, gate)) = state.pause_at.take() {
                        gate.pause();
                    }
                }
                if state.stall_times > 0
                    && state.stall_at.is_some_and(|offset| self.cursor >= offset)
                {
                    state.stall_times -= 1;
                    Served::Stall
                } else if state.fail_times > 0
                    && state.fail_at.is_some_and(|offset| self.cursor >= offset)
                {
                    state.fail_times -= 1;
                    Served::Fail
                } else if self.cursor >= state.served_len() {
                    Served::End
                } else {
                    let left = state.served_len() - self.cursor;
                    let frame = if state.frame_size == 0 {
                        left
                    } else {
                        state.frame_size.min(left)
                    };
                    let data =
                        Bytes::copy_from_slice(&state.image[self.cursor..self.cursor + frame]);
                    self.cursor += frame;
                    Served::Data(data)
                }
            };
            match served {
                Served::Data(data) => Ok(Some(data)),
                Served::End => Ok(None),
                Served::Fail => Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset",
                ))),
                Served::Stall => {
                    future::pending::<()>().await;
                    unreachable!()
                }
            }
        })
    }

    fn total_size(&self) -> Option<usize> {
        Some(self.state.borrow().declared_total())
    }

    fn bytes_received(&self) -> usize {
        self.cursor
    }

    fn is_complete(&self) -> bool {
        self.cursor == self.state.borrow().declared_total()
    }
}

pub(crate) fn test_config() -> UpdateConfig {
    UpdateConfig::new("http://firmware.local:3001")
        .unwrap()
        .with_chunk_timeout(Duration::from_millis(200))
}

pub(crate) fn make_image(version: &str, payload: &[u8]) -> Vec<u8> {
    let desc = AppDescriptor::for_payload(version, "unit-test-fw", payload);
    build_image(&desc, payload).unwrap()
}

/// A machine wired to a scripted server and an in-memory slot, plus the
/// handles to inspect both afterwards.
pub(crate) fn updater_with(
    state: ServerState,
) -> (
    OtaUpdater<FakeTransport, InMemorySlot>,
    Rc<RefCell<ServerState>>,
    InMemorySlot,
) {
    let (transport, state) = FakeTransport::new(state);
    let slot = InMemorySlot::new();
    let updater = OtaUpdater::new(
        transport,
        slot.clone(),
        VersionStore::new(FirmwareVersion::from(RUNNING_VERSION)),
        test_config(),
    );
    (updater, state, slot)
}
