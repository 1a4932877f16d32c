use serde::{Deserialize, Serialize};

/// Identity of the connected device, read once when a session is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChipInfo {
    /// Factory identifier unique to the device, derived from its MAC.
    pub chip_id: String,
    /// Usable flash size in bytes as reported by the bootloader.
    pub flash_size: u32,
    /// Version string of the loader stub answering download-mode commands.
    pub sdk_version: String,
}
