//! Update state machine: decides whether an offered image is new, streams it
//! into the update slot and verifies it, or rolls everything back.
//!
//! One call to [`OtaUpdater::poll_for_update`] runs one full cycle:
//!
//! `Idle -> MetadataFetch -> VersionCompare -> Downloading -> Committing -> Idle`
//!
//! Every failure takes the `Aborting` arm back to `Idle` with the update slot
//! rolled back, so the next cycle starts from scratch. Nothing is activated
//! from here; a committed image waits in the slot for a device restart.
//!
//! Images start with a fixed 256 byte descriptor carrying the firmware
//! version, and the decision to download is byte equality between the
//! descriptor version and the running one. A download interrupted by a
//! transport error is resumed from the last confirmed byte a bounded number
//! of times; a stream the server ends early is not retried, since the server
//! itself decided to stop.

use std::time::Duration;

use async_io::Timer;
use bytes::{Bytes, BytesMut};
use futures_lite::future;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::common::{
    config::UpdateConfig,
    sched::PauseGate,
    target::{TargetError, UpdateTarget},
    transport::{ImageDownload, TransportError, UpdateTransport},
    version::{AppDescriptor, VersionError, VersionStore, SIZEOF_APP_DESC},
};

/// largest image accepted into an update slot
pub const OTA_MAX_IMAGE_SIZE: usize = 1024 * 1024 * 4;

#[derive(Error, Debug)]
pub enum OtaError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error(transparent)]
    Version(#[from] VersionError),
    #[error("new image size is invalid: {0} bytes")]
    InvalidImageSize(usize),
    #[error("download ended at {received} of {expected} bytes")]
    IncompleteDownload { received: usize, expected: usize },
    #[error("failed to commit update: {0}")]
    CommitFailure(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    MetadataFetch,
    VersionCompare,
    Downloading,
    Committing,
    Aborting,
}

/// What one poll concluded. All three are successful cycles; errors travel
/// separately as [`OtaError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// the server had nothing staged
    NoUpdateAvailable,
    /// the staged image is the running firmware
    AlreadyCurrent,
    /// an image is in the slot, restart to activate
    UpdateReady,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    NotStarted,
    HeaderFetched,
    InProgress,
    Complete,
    Aborted,
}

/// Progress of the most recent download attempt. Rebuilt from scratch every
/// cycle; nothing in here carries over between polls.
#[derive(Debug)]
pub struct UpdateSession {
    filename: String,
    total_size: Option<usize>,
    bytes_read: usize,
    status: SessionStatus,
}

impl UpdateSession {
    fn new(filename: &str) -> Self {
        Self {
            filename: filename.to_owned(),
            total_size: None,
            bytes_read: 0,
            status: SessionStatus::NotStarted,
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// declared image size, known once the first response arrived
    pub fn total_size(&self) -> Option<usize> {
        self.total_size
    }

    /// bytes accepted into the update slot so far
    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn progress_percent(&self) -> Option<u8> {
        self.total_size
            .map(|total| ((self.bytes_read * 100) / total.max(1)) as u8)
    }
}

/// The device side of firmware updates, generic over how images are fetched
/// and where they land.
pub struct OtaUpdater<T: UpdateTransport, G: UpdateTarget> {
    transport: T,
    target: G,
    versions: VersionStore,
    config: UpdateConfig,
    state: UpdateState,
    update_ready: bool,
    last_session: Option<UpdateSession>,
    gate: PauseGate,
}

impl<T: UpdateTransport, G: UpdateTarget> OtaUpdater<T, G> {
    pub fn new(transport: T, target: G, versions: VersionStore, config: UpdateConfig) -> Self {
        Self {
            transport,
            target,
            versions,
            config,
            state: UpdateState::Idle,
            update_ready: false,
            last_session: None,
            gate: PauseGate::new(),
        }
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// True once an image has been committed to the slot. Stays true until
    /// the device restarts into it.
    pub fn is_update_ready(&self) -> bool {
        self.update_ready
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    /// The pause switch honored between download chunks; clones share it.
    pub fn pause_gate(&self) -> PauseGate {
        self.gate.clone()
    }

    pub fn last_session(&self) -> Option<&UpdateSession> {
        self.last_session.as_ref()
    }

    fn set_state(&mut self, state: UpdateState) {
        log::debug!("update state {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Runs one update cycle and lands back in `Idle` whatever happens.
    /// Errors mean the cycle was aborted and the slot rolled back; they never
    /// poison the machine, the next poll starts fresh.
    pub async fn poll_for_update(&mut self) -> Result<PollOutcome, OtaError> {
        if self.update_ready {
            return Ok(PollOutcome::UpdateReady);
        }
        self.last_session = None;
        let outcome = self.run_cycle().await;
        match &outcome {
            Ok(_) => self.set_state(UpdateState::Idle),
            Err(e) => {
                self.set_state(UpdateState::Aborting);
                log::error!("update cycle aborted: {}", e);
                if let Err(abort_err) = self.target.abort() {
                    log::error!("failed to roll back update slot: {}", abort_err);
                }
                if let Some(session) = self.last_session.as_mut() {
                    session.status = SessionStatus::Aborted;
                }
                self.set_state(UpdateState::Idle);
            }
        }
        outcome
    }

    async fn run_cycle(&mut self) -> Result<PollOutcome, OtaError> {
        self.set_state(UpdateState::MetadataFetch);
        let filename = match self.transport.fetch_update_info().await? {
            Some(filename) => filename,
            None => {
                log::debug!("no update staged on the server");
                return Ok(PollOutcome::NoUpdateAvailable);
            }
        };
        self.evaluate_and_download(filename).await
    }

    async fn evaluate_and_download(&mut self, filename: String) -> Result<PollOutcome, OtaError> {
        self.last_session = Some(UpdateSession::new(&filename));
        self.set_state(UpdateState::VersionCompare);

        let mut download = self.open_with_timeout(filename.clone(), 0).await?;
        let mut head = BytesMut::new();
        while head.len() < SIZEOF_APP_DESC {
            match Self::next_frame_with_timeout(self.config.chunk_timeout(), &mut download).await?
            {
                Some(data) => head.extend_from_slice(&data),
                None => break,
            }
        }
        let total = download
            .total_size()
            .ok_or(TransportError::MissingContentLength)?;
        if !(SIZEOF_APP_DESC..=OTA_MAX_IMAGE_SIZE).contains(&total) {
            return Err(OtaError::InvalidImageSize(total));
        }
        let desc = AppDescriptor::from_image_prefix(&head)?;
        if let Some(session) = self.last_session.as_mut() {
            session.total_size = Some(total);
            session.status = SessionStatus::HeaderFetched;
        }

        let offered = desc.version();
        let running = *self.versions.running();
        if offered == running {
            log::info!("offered firmware {} is already running, nothing to do", offered);
            self.set_state(UpdateState::Aborting);
            if let Some(session) = self.last_session.as_mut() {
                session.status = SessionStatus::Aborted;
            }
            return Ok(PollOutcome::AlreadyCurrent);
        }

        log::info!(
            "new firmware {} offered (running {}), downloading `{}` ({} bytes)",
            offered,
            running,
            filename,
            total
        );
        self.set_state(UpdateState::Downloading);
        self.target.begin(total)?;
        self.target.write(&head)?;
        let mut hasher = Sha256::new();
        hasher.update(&head[SIZEOF_APP_DESC..]);
        if let Some(session) = self.last_session.as_mut() {
            session.bytes_read = head.len();
            session.status = SessionStatus::InProgress;
        }

        self.run_download(&filename, total, &mut download, &mut hasher)
            .await?;
        self.commit(download, &desc, hasher)
    }

    /// Streams the image body into the slot, honoring the pause gate between
    /// chunks. Transport errors resume from the last confirmed byte until the
    /// retry budget runs out; a clean early end is left for
    /// [`commit`](Self::commit) to reject.
    async fn run_download(
        &mut self,
        filename: &str,
        expected: usize,
        download: &mut T::Download,
        hasher: &mut Sha256,
    ) -> Result<(), OtaError> {
        let mut retries_left = self.config.max_chunk_retries();
        let mut last_decile = 0u8;
        loop {
            self.gate.ready().await;
            match Self::next_frame_with_timeout(self.config.chunk_timeout(), download).await {
                Ok(Some(data)) => {
                    self.target.write(&data)?;
                    hasher.update(&data);
                    if let Some(session) = self.last_session.as_mut() {
                        session.bytes_read += data.len();
                        if let Some(percent) = session.progress_percent() {
                            if percent / 10 != last_decile {
                                last_decile = percent / 10;
                                log::info!(
                                    "downloading `{}`: {}% ({} / {} bytes)",
                                    session.filename,
                                    percent,
                                    session.bytes_read,
                                    expected
                                );
                            }
                        }
                    }
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    if download.is_complete() {
                        // every byte arrived, the error was trailing noise
                        log::debug!("ignoring error on a finished download: {}", e);
                        return Ok(());
                    }
                    let mut err = e;
                    loop {
                        if matches!(err, TransportError::RangeNotSupported) {
                            return Err(err.into());
                        }
                        if retries_left == 0 {
                            return Err(err.into());
                        }
                        retries_left -= 1;
                        let resume_from = download.bytes_received();
                        log::error!(
                            "download of `{}` interrupted at {} bytes ({}), {} retries left",
                            filename,
                            resume_from,
                            err,
                            retries_left
                        );
                        match self.open_with_timeout(filename.to_owned(), resume_from).await {
                            Ok(reopened) => match reopened.total_size() {
                                Some(now) if now == expected => {
                                    *download = reopened;
                                    break;
                                }
                                Some(now) => {
                                    err = TransportError::SizeChanged { was: expected, now }
                                }
                                None => err = TransportError::MissingContentLength,
                            },
                            Err(e) => err = e,
                        }
                    }
                }
            }
        }
    }

    /// Refuses anything short of a byte-complete, digest-verified image, then
    /// seals the slot.
    fn commit(
        &mut self,
        download: T::Download,
        desc: &AppDescriptor,
        hasher: Sha256,
    ) -> Result<PollOutcome, OtaError> {
        self.set_state(UpdateState::Committing);
        let received = download.bytes_received();
        let expected = download.total_size().unwrap_or(0);
        if !download.is_complete() {
            return Err(OtaError::IncompleteDownload { received, expected });
        }
        let digest: [u8; 32] = hasher.finalize().into();
        if &digest != desc.payload_sha256() {
            return Err(OtaError::CommitFailure("payload digest mismatch".to_owned()));
        }
        self.target
            .complete()
            .map_err(|e| OtaError::CommitFailure(e.to_string()))?;
        self.update_ready = true;
        if let Some(session) = self.last_session.as_mut() {
            session.status = SessionStatus::Complete;
        }
        log::info!("firmware {} staged, restart to activate", desc.version());
        Ok(PollOutcome::UpdateReady)
    }

    async fn open_with_timeout(
        &mut self,
        filename: String,
        resume_from: usize,
    ) -> Result<T::Download, TransportError> {
        let timeout = self.config.chunk_timeout();
        future::or(self.transport.open_download(filename, resume_from), async {
            Timer::after(timeout).await;
            Err(TransportError::Timeout(timeout))
        })
        .await
    }

    async fn next_frame_with_timeout(
        timeout: Duration,
        download: &mut T::Download,
    ) -> Result<Option<Bytes>, TransportError> {
        future::or(download.next_frame(), async {
            Timer::after(timeout).await;
            Err(TransportError::Timeout(timeout))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::exec::Executor;
    use crate::common::testutil::{make_image, updater_with, ServerState, RUNNING_VERSION};

    #[test_log::test]
    fn test_no_update_staged() {
        let exec = Executor::new();
        let (mut updater, state, slot) = updater_with(ServerState::default());
        let outcome = exec.block_on(updater.poll_for_update()).unwrap();
        assert_eq!(outcome, PollOutcome::NoUpdateAvailable);
        assert_eq!(updater.state(), UpdateState::Idle);
        assert!(!updater.is_update_ready());
        assert!(updater.last_session().is_none());
        assert!(state.borrow().opens.is_empty());
        assert_eq!(slot.bytes_written(), 0);
    }

    #[test_log::test]
    fn test_same_version_aborts_before_download() {
        let exec = Executor::new();
        let image = make_image(RUNNING_VERSION, &[0x42; 2048]);
        let (mut updater, state, slot) = updater_with(ServerState {
            info: Some("fw.bin".to_owned()),
            image,
            ..Default::default()
        });
        let outcome = exec.block_on(updater.poll_for_update()).unwrap();
        assert_eq!(outcome, PollOutcome::AlreadyCurrent);
        assert_eq!(updater.state(), UpdateState::Idle);
        assert!(!updater.is_update_ready());
        // the header was enough to decide, the slot never opened
        assert_eq!(state.borrow().opens.len(), 1);
        assert_eq!(slot.bytes_written(), 0);
        assert!(!slot.is_activated());
        let session = updater.last_session().unwrap();
        assert_eq!(session.status(), SessionStatus::Aborted);
        assert_eq!(session.bytes_read(), 0);
    }

    #[test_log::test]
    fn test_new_version_downloads_and_stages() {
        let exec = Executor::new();
        let image = make_image("2.0.0", &[0x42; 10 * 1024]);
        let (mut updater, state, slot) = updater_with(ServerState {
            info: Some("fw_v2.bin".to_owned()),
            image: image.clone(),
            frame_size: 1024,
            ..Default::default()
        });
        let outcome = exec.block_on(updater.poll_for_update()).unwrap();
        assert_eq!(outcome, PollOutcome::UpdateReady);
        assert!(updater.is_update_ready());
        assert!(slot.is_activated());
        assert_eq!(slot.data(), image);
        let session = updater.last_session().unwrap();
        assert_eq!(session.status(), SessionStatus::Complete);
        assert_eq!(session.bytes_read(), image.len());
        assert_eq!(session.total_size(), Some(image.len()));
        assert_eq!(session.progress_percent(), Some(100));

        // once staged, later polls answer from memory without the network
        let info_calls = state.borrow().info_calls;
        let outcome = exec.block_on(updater.poll_for_update()).unwrap();
        assert_eq!(outcome, PollOutcome::UpdateReady);
        assert_eq!(state.borrow().info_calls, info_calls);
    }

    #[test_log::test]
    fn test_truncated_stream_aborts_without_commit() {
        let exec = Executor::new();
        let image = make_image("2.0.0", &[0x42; 8 * 1024]);
        let total = image.len();
        let (mut updater, state, slot) = updater_with(ServerState {
            info: Some("fw_v2.bin".to_owned()),
            image,
            frame_size: 512,
            truncate_at: Some(4096),
            ..Default::default()
        });
        let result = exec.block_on(updater.poll_for_update());
        assert!(matches!(
            result,
            Err(OtaError::IncompleteDownload {
                received: 4096,
                expected
            }) if expected == total
        ));
        assert_eq!(updater.state(), UpdateState::Idle);
        assert!(!updater.is_update_ready());
        assert!(slot.is_aborted());
        assert!(!slot.is_activated());
        // the server closed cleanly, a shorter image is not worth retrying
        assert_eq!(state.borrow().opens.len(), 1);
        assert_eq!(
            updater.last_session().unwrap().status(),
            SessionStatus::Aborted
        );
    }

    #[test_log::test]
    fn test_transport_error_resumes_from_last_byte() {
        let exec = Executor::new();
        let image = make_image("2.0.0", &[0x42; 8 * 1024]);
        let (mut updater, state, slot) = updater_with(ServerState {
            info: Some("fw_v2.bin".to_owned()),
            image: image.clone(),
            frame_size: 512,
            fail_at: Some(1500),
            fail_times: 1,
            ..Default::default()
        });
        let outcome = exec.block_on(updater.poll_for_update()).unwrap();
        assert_eq!(outcome, PollOutcome::UpdateReady);
        // 512 byte frames put the cursor at 1536 when the connection died
        assert_eq!(state.borrow().opens, vec![0, 1536]);
        assert_eq!(slot.data(), image);
        assert!(slot.is_activated());
    }

    #[test_log::test]
    fn test_retries_exhausted_aborts() {
        let exec = Executor::new();
        let image = make_image("2.0.0", &[0x42; 8 * 1024]);
        let (mut updater, state, slot) = updater_with(ServerState {
            info: Some("fw_v2.bin".to_owned()),
            image,
            frame_size: 512,
            fail_at: Some(1500),
            fail_times: 99,
            ..Default::default()
        });
        let result = exec.block_on(updater.poll_for_update());
        assert!(matches!(result, Err(OtaError::Transport(_))));
        // initial open plus one per retry
        assert_eq!(state.borrow().opens, vec![0, 1536, 1536, 1536]);
        assert!(slot.is_aborted());
        assert!(!updater.is_update_ready());
    }

    #[test_log::test]
    fn test_refused_reopens_burn_retries() {
        let exec = Executor::new();
        let image = make_image("2.0.0", &[0x42; 8 * 1024]);
        let (mut updater, state, slot) = updater_with(ServerState {
            info: Some("fw_v2.bin".to_owned()),
            image,
            frame_size: 512,
            fail_at: Some(1500),
            fail_times: 1,
            refuse_resume: true,
            ..Default::default()
        });
        let result = exec.block_on(updater.poll_for_update());
        assert!(matches!(result, Err(OtaError::Transport(_))));
        assert_eq!(state.borrow().opens, vec![0, 1536, 1536, 1536]);
        assert!(slot.is_aborted());
    }

    #[test_log::test]
    fn test_info_error_is_not_fatal() {
        let exec = Executor::new();
        let image = make_image("2.0.0", &[0x42; 2048]);
        let (mut updater, _state, slot) = updater_with(ServerState {
            info: Some("fw_v2.bin".to_owned()),
            image: image.clone(),
            info_failures: 1,
            ..Default::default()
        });
        let result = exec.block_on(updater.poll_for_update());
        assert!(matches!(result, Err(OtaError::Transport(_))));
        assert_eq!(updater.state(), UpdateState::Idle);
        assert_eq!(slot.bytes_written(), 0);

        // the next poll is a clean slate
        let outcome = exec.block_on(updater.poll_for_update()).unwrap();
        assert_eq!(outcome, PollOutcome::UpdateReady);
        assert_eq!(slot.data(), image);
    }

    #[test_log::test]
    fn test_image_without_descriptor_rejected() {
        let exec = Executor::new();
        let (mut updater, _state, slot) = updater_with(ServerState {
            info: Some("garbage.bin".to_owned()),
            image: vec![0xFF; 1024],
            ..Default::default()
        });
        let result = exec.block_on(updater.poll_for_update());
        assert!(matches!(result, Err(OtaError::Version(_))));
        assert_eq!(slot.bytes_written(), 0);
        assert!(!updater.is_update_ready());
    }

    #[test_log::test]
    fn test_payload_digest_mismatch_fails_commit() {
        let exec = Executor::new();
        let mut image = make_image("2.0.0", &[0x42; 4096]);
        // corrupt one payload byte, leaving the descriptor parsable
        image[SIZEOF_APP_DESC + 100] ^= 0xFF;
        let (mut updater, _state, slot) = updater_with(ServerState {
            info: Some("fw_v2.bin".to_owned()),
            image,
            frame_size: 1024,
            ..Default::default()
        });
        let result = exec.block_on(updater.poll_for_update());
        assert!(matches!(result, Err(OtaError::CommitFailure(_))));
        assert!(slot.is_aborted());
        assert!(!slot.is_activated());
        assert!(!updater.is_update_ready());
    }

    #[test_log::test]
    fn test_declared_size_out_of_bounds() {
        let exec = Executor::new();
        let image = make_image("2.0.0", &[0x42; 1024]);
        let (mut updater, _state, slot) = updater_with(ServerState {
            info: Some("fw_v2.bin".to_owned()),
            image: image.clone(),
            declared_total: Some(OTA_MAX_IMAGE_SIZE + 1),
            ..Default::default()
        });
        let result = exec.block_on(updater.poll_for_update());
        assert!(matches!(result, Err(OtaError::InvalidImageSize(_))));
        assert_eq!(slot.bytes_written(), 0);

        let (mut updater, _state, slot) = updater_with(ServerState {
            info: Some("fw_v2.bin".to_owned()),
            image,
            declared_total: Some(100),
            ..Default::default()
        });
        let result = exec.block_on(updater.poll_for_update());
        assert!(matches!(result, Err(OtaError::InvalidImageSize(100))));
        assert_eq!(slot.bytes_written(), 0);
    }

    #[test_log::test]
    fn test_stalled_stream_times_out_and_resumes() {
        let exec = Executor::new();
        let image = make_image("2.0.0", &[0x42; 4096]);
        let (mut updater, state, slot) = updater_with(ServerState {
            info: Some("fw_v2.bin".to_owned()),
            image: image.clone(),
            frame_size: 512,
            stall_at: Some(1024),
            stall_times: 1,
            ..Default::default()
        });
        let outcome = exec.block_on(updater.poll_for_update()).unwrap();
        assert_eq!(outcome, PollOutcome::UpdateReady);
        assert_eq!(state.borrow().opens, vec![0, 1024]);
        assert_eq!(slot.data(), image);
    }

    #[test_log::test]
    fn test_pause_mid_download_keeps_byte_counters() {
        let exec = Executor::new();
        let image = make_image("2.0.0", &[0x42; 8 * 1024]);
        let (mut updater, state, slot) = updater_with(ServerState {
            info: Some("fw_v2.bin".to_owned()),
            image: image.clone(),
            frame_size: 512,
            ..Default::default()
        });
        state.borrow_mut().pause_at = Some((2048, updater.pause_gate()));
        let gate = updater.pause_gate();
        let outcome = exec.block_on(async {
            let resumer = exec.spawn(async move {
                loop {
                    Timer::after(Duration::from_millis(10)).await;
                    if gate.is_paused() {
                        gate.resume();
                        break;
                    }
                }
            });
            let outcome = updater.poll_for_update().await.unwrap();
            resumer.await;
            outcome
        });
        assert_eq!(outcome, PollOutcome::UpdateReady);
        // the pause parked the flow between chunks, nothing lost or doubled
        assert_eq!(slot.data(), image);
        assert_eq!(
            updater.last_session().unwrap().bytes_read(),
            image.len()
        );
        assert_eq!(state.borrow().opens, vec![0]);
    }
}
