//! The update slot an image is streamed into. On esp32 this is the inactive
//! OTA partition; on native hosts an in-memory buffer stands in.

use std::rc::Rc;
use std::sync::Mutex;

use thiserror::Error;

#[cfg(feature = "esp32")]
use crate::esp32::esp_idf_svc::sys::EspError;

#[derive(Error, Debug)]
pub enum TargetError {
    #[error("no update in progress")]
    NoUpdateInProgress,
    #[error("invalid update size: {0} bytes")]
    InvalidSize(usize),
    #[error("write of {requested} bytes exceeds declared size {declared}")]
    Overflow { requested: usize, declared: usize },
    #[error("slot holds {written} of {declared} declared bytes")]
    Underfilled { written: usize, declared: usize },
    #[cfg(feature = "esp32")]
    #[error(transparent)]
    EspError(#[from] EspError),
    #[error("{0}")]
    Other(String),
}

/// Write side of an update session.
///
/// `begin` opens the slot for a declared number of bytes, `write` appends,
/// and exactly one of `complete` (activate on next boot) or `abort` (discard)
/// closes it. `complete` must refuse a slot holding fewer bytes than were
/// declared; a partial image is never activatable. `abort` outside a session
/// is a no-op so callers can clean up unconditionally.
pub trait UpdateTarget {
    fn begin(&mut self, declared_size: usize) -> Result<(), TargetError>;
    fn write(&mut self, chunk: &[u8]) -> Result<usize, TargetError>;
    fn complete(&mut self) -> Result<(), TargetError>;
    fn abort(&mut self) -> Result<(), TargetError>;
}

#[derive(Default)]
struct InMemorySlotInner {
    buf: Vec<u8>,
    declared: Option<usize>,
    activated: bool,
    aborted: bool,
}

/// Buffer-backed slot for native hosts and tests. Clones share the same
/// underlying slot.
#[derive(Default, Clone)]
pub struct InMemorySlot(Rc<Mutex<InMemorySlotInner>>);

impl InMemorySlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes_written(&self) -> usize {
        self.0.lock().unwrap().buf.len()
    }

    pub fn data(&self) -> Vec<u8> {
        self.0.lock().unwrap().buf.clone()
    }

    pub fn is_activated(&self) -> bool {
        self.0.lock().unwrap().activated
    }

    pub fn is_aborted(&self) -> bool {
        self.0.lock().unwrap().aborted
    }
}

impl UpdateTarget for InMemorySlot {
    fn begin(&mut self, declared_size: usize) -> Result<(), TargetError> {
        if declared_size == 0 {
            return Err(TargetError::InvalidSize(declared_size));
        }
        let mut inner = self.0.lock().unwrap();
        inner.buf = Vec::with_capacity(declared_size);
        inner.declared = Some(declared_size);
        inner.activated = false;
        inner.aborted = false;
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<usize, TargetError> {
        let mut inner = self.0.lock().unwrap();
        let declared = inner.declared.ok_or(TargetError::NoUpdateInProgress)?;
        if inner.buf.len() + chunk.len() > declared {
            return Err(TargetError::Overflow {
                requested: inner.buf.len() + chunk.len(),
                declared,
            });
        }
        inner.buf.extend_from_slice(chunk);
        Ok(chunk.len())
    }

    fn complete(&mut self) -> Result<(), TargetError> {
        let mut inner = self.0.lock().unwrap();
        let declared = inner.declared.ok_or(TargetError::NoUpdateInProgress)?;
        if inner.buf.len() != declared {
            return Err(TargetError::Underfilled {
                written: inner.buf.len(),
                declared,
            });
        }
        inner.declared = None;
        inner.activated = true;
        Ok(())
    }

    fn abort(&mut self) -> Result<(), TargetError> {
        let mut inner = self.0.lock().unwrap();
        if inner.declared.take().is_some() {
            inner.buf.clear();
            inner.aborted = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn test_slot_happy_path() {
        let mut slot = InMemorySlot::new();
        slot.begin(10).unwrap();
        assert_eq!(slot.write(b"hello").unwrap(), 5);
        assert_eq!(slot.write(b"world").unwrap(), 5);
        slot.complete().unwrap();
        assert!(slot.is_activated());
        assert_eq!(slot.data(), b"helloworld");
    }

    #[test_log::test]
    fn test_slot_refuses_out_of_session_use() {
        let mut slot = InMemorySlot::new();
        assert!(matches!(
            slot.write(b"x"),
            Err(TargetError::NoUpdateInProgress)
        ));
        assert!(matches!(
            slot.complete(),
            Err(TargetError::NoUpdateInProgress)
        ));
        // abort without a session is a no-op
        slot.abort().unwrap();
        assert!(!slot.is_aborted());
    }

    #[test_log::test]
    fn test_slot_refuses_partial_activation() {
        let mut slot = InMemorySlot::new();
        slot.begin(10).unwrap();
        slot.write(b"hello").unwrap();
        assert!(matches!(
            slot.complete(),
            Err(TargetError::Underfilled {
                written: 5,
                declared: 10
            })
        ));
        assert!(!slot.is_activated());
        // still open, can be aborted
        slot.abort().unwrap();
        assert!(slot.is_aborted());
        assert_eq!(slot.bytes_written(), 0);
    }

    #[test_log::test]
    fn test_slot_bounds_writes() {
        let mut slot = InMemorySlot::new();
        slot.begin(4).unwrap();
        assert!(matches!(
            slot.write(b"hello"),
            Err(TargetError::Overflow { .. })
        ));
        assert!(matches!(slot.begin(0), Err(TargetError::InvalidSize(0))));
    }

    #[test_log::test]
    fn test_slot_begin_resets_previous_attempt() {
        let mut slot = InMemorySlot::new();
        slot.begin(5).unwrap();
        slot.write(b"abc").unwrap();
        slot.begin(2).unwrap();
        slot.write(b"xy").unwrap();
        slot.complete().unwrap();
        assert_eq!(slot.data(), b"xy");
    }

    #[test_log::test]
    fn test_slot_clones_share_state() {
        let mut slot = InMemorySlot::new();
        let observer = slot.clone();
        slot.begin(3).unwrap();
        slot.write(b"abc").unwrap();
        slot.complete().unwrap();
        assert!(observer.is_activated());
        assert_eq!(observer.data(), b"abc");
    }
}
