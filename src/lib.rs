//! Flash backup and restore engine for microcontrollers reachable over a
//! serial link in bootloader download mode.
//!
//! The [`session`] module owns device access, [`backup`] and [`restore`]
//! orchestrate chunked transfers with integrity checks from [`verify`], and
//! [`catalog`] keeps the published artifact/metadata pairs.

pub mod backup;
pub mod catalog;
pub mod chip;
pub mod cli;
pub mod config;
pub mod error;
pub mod partition;
pub mod progress;
pub mod restore;
pub mod session;
pub mod verify;

pub use chip::ChipInfo;
pub use config::Config;
pub use error::{Error, Result};
