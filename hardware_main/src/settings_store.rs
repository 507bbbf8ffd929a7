//! Settings persisted in the last page of internal flash.
//!
//! Layout: 4-byte magic, little-endian u16 record length, 2 reserved bytes,
//! then the text record from `Settings::encode`, padded with 0xFF to the
//! 8-byte flash write size.

use embassy_stm32::flash::{Blocking, Flash};

use business_logic::config::{SETTINGS_RECORD_LEN, Settings};
use business_logic::notification::TransportError;
use crate::fmt::{info, warn};

const PAGE_OFFSET: u32 = 0x7F800; // Last 2 KiB page of the 512 KiB bank.
const PAGE_SIZE: u32 = 2048;
const WRITE_SIZE: usize = 8;
const MAGIC: [u8; 4] = *b"GHS1";
const HEADER_LEN: usize = 8;
const IMAGE_LEN: usize = HEADER_LEN + SETTINGS_RECORD_LEN;

pub struct SettingsStore {
    flash: Flash<'static, Blocking>,
}

impl SettingsStore {
    pub fn new(flash: Flash<'static, Blocking>) -> Self {
        Self { flash }
    }

    /// Load saved settings, or the defaults when nothing usable is stored.
    pub fn load_or_default(&mut self) -> Settings {
        match self.load() {
            Ok(settings) => {
                info!("settings loaded from flash");
                settings
            }
            Err(_) => {
                warn!("no usable settings in flash, using defaults");
                Settings::default()
            }
        }
    }

    pub fn load(&mut self) -> Result<Settings, TransportError> {
        let mut header = [0u8; HEADER_LEN];
        self.flash
            .blocking_read(PAGE_OFFSET, &mut header)
            .map_err(|_| TransportError::Storage)?;
        if header[..4] != MAGIC {
            return Err(TransportError::Storage);
        }
        let len = usize::from(u16::from_le_bytes([header[4], header[5]]));
        if len > SETTINGS_RECORD_LEN {
            return Err(TransportError::Storage);
        }
        let mut record = [0u8; SETTINGS_RECORD_LEN];
        self.flash
            .blocking_read(PAGE_OFFSET + HEADER_LEN as u32, &mut record[..len])
            .map_err(|_| TransportError::Storage)?;
        let text = core::str::from_utf8(&record[..len]).map_err(|_| TransportError::Storage)?;
        Settings::decode(text).map_err(|err| {
            warn!("stored settings rejected: {}", err);
            TransportError::Storage
        })
    }

    pub fn save(&mut self, settings: &Settings) -> Result<(), TransportError> {
        let record = settings.encode(true).map_err(|_| TransportError::Storage)?;
        let len = record.len();
        let mut image = [0xFFu8; IMAGE_LEN];
        image[..4].copy_from_slice(&MAGIC);
        image[4..6].copy_from_slice(&(len as u16).to_le_bytes());
        image[HEADER_LEN..HEADER_LEN + len].copy_from_slice(record.as_bytes());
        let padded = (HEADER_LEN + len).next_multiple_of(WRITE_SIZE);

        self.flash
            .blocking_erase(PAGE_OFFSET, PAGE_OFFSET + PAGE_SIZE)
            .map_err(|_| TransportError::Storage)?;
        self.flash
            .blocking_write(PAGE_OFFSET, &image[..padded])
            .map_err(|_| TransportError::Storage)?;
        info!("settings saved ({} bytes)", len);
        Ok(())
    }
}
