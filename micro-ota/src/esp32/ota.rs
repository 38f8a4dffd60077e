//! Update slot backed by the inactive app partition.

use esp_idf_svc::ota::{EspOta, EspOtaUpdate};

use crate::common::{
    target::{TargetError, UpdateTarget},
    version::{FirmwareVersion, SIZEOF_APP_DESC},
};

enum SlotHandle {
    Idle,
    Updating(EspOtaUpdate<'static>),
}

/// [`UpdateTarget`] streaming into the inactive OTA partition through
/// `esp_ota_*`.
///
/// The leading descriptor of an image is transport metadata, not part of the
/// bootable app; writes drop those bytes so the partition receives the
/// payload alone.
pub struct EspOtaSlot {
    // Leaked on construction so update handles borrowing it can be held
    // across writes. The slot is a process singleton (EspOta::new refuses a
    // second instance), so the allocation lives for the program lifetime
    // anyway.
    ota: *mut EspOta,
    handle: SlotHandle,
    declared: usize,
    written: usize,
}

impl EspOtaSlot {
    pub fn new() -> Result<Self, TargetError> {
        let ota: *mut EspOta = Box::leak(Box::new(EspOta::new()?));
        Ok(Self {
            ota,
            handle: SlotHandle::Idle,
            declared: 0,
            written: 0,
        })
    }

    /// Version of the firmware in the currently booted slot, falling back to
    /// the version this crate was compiled with when the bootloader reports
    /// none.
    pub fn running_version(&self) -> Result<FirmwareVersion, TargetError> {
        // Safety: `ota` was leaked in `new` and is never freed
        let slot = unsafe { (*self.ota).get_running_slot() }?;
        Ok(match slot.firmware {
            Some(info) => FirmwareVersion::from(info.version.as_str()),
            None => FirmwareVersion::from(env!("CARGO_PKG_VERSION")),
        })
    }

    /// Reboots so the bootloader picks up whatever slot is marked current;
    /// called after a committed update to hand control to the staged
    /// firmware.
    pub fn restart() -> ! {
        log::info!("rebooting to activate staged firmware");
        esp_idf_svc::hal::reset::restart();
        unreachable!();
    }
}

impl UpdateTarget for EspOtaSlot {
    fn begin(&mut self, declared_size: usize) -> Result<(), TargetError> {
        if declared_size <= SIZEOF_APP_DESC {
            return Err(TargetError::InvalidSize(declared_size));
        }
        // a previous session that was never closed is discarded
        if let SlotHandle::Updating(stale) = std::mem::replace(&mut self.handle, SlotHandle::Idle) {
            let _ = stale.abort();
        }
        // Safety: `ota` was leaked in `new` and is never freed
        let update = unsafe { (*self.ota).initiate_update() }?;
        self.handle = SlotHandle::Updating(update);
        self.declared = declared_size;
        self.written = 0;
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<usize, TargetError> {
        let update = match &mut self.handle {
            SlotHandle::Updating(update) => update,
            SlotHandle::Idle => return Err(TargetError::NoUpdateInProgress),
        };
        if self.written + chunk.len() > self.declared {
            return Err(TargetError::Overflow {
                requested: self.written + chunk.len(),
                declared: self.declared,
            });
        }
        // skip however much of the descriptor this chunk still covers
        let skip = SIZEOF_APP_DESC.saturating_sub(self.written).min(chunk.len());
        if skip < chunk.len() {
            update.write(&chunk[skip..])?;
        }
        self.written += chunk.len();
        Ok(chunk.len())
    }

    fn complete(&mut self) -> Result<(), TargetError> {
        match std::mem::replace(&mut self.handle, SlotHandle::Idle) {
            SlotHandle::Updating(update) => {
                if self.written != self.declared {
                    let _ = update.abort();
                    return Err(TargetError::Underfilled {
                        written: self.written,
                        declared: self.declared,
                    });
                }
                update.complete()?;
                log::info!("staged firmware will boot on next reset");
                Ok(())
            }
            SlotHandle::Idle => Err(TargetError::NoUpdateInProgress),
        }
    }

    fn abort(&mut self) -> Result<(), TargetError> {
        if let SlotHandle::Updating(update) = std::mem::replace(&mut self.handle, SlotHandle::Idle)
        {
            update.abort()?;
            log::debug!("update slot rolled back");
        }
        Ok(())
    }
}

impl Drop for EspOtaSlot {
    fn drop(&mut self) {
        let _ = self.abort();
    }
}
