#![cfg_attr(not(test), no_std)]

//! MMC/eMMC card manager on top of an SD/MMC host controller.
//!
//! [`emmc::MmcCard`] owns the host controller, a time source and optionally a DMA engine,
//! brings the card up with [`emmc::MmcCard::init`] and moves 512-byte blocks by polling,
//! by interrupt or by DMA.

pub mod emmc;
mod err;

pub use err::{ErrorCode, MmcError};
