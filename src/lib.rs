//! CrabSD - SD/MMC host-controller transaction engine
//!
//! This library drives an SD/MMC host controller through single card
//! commands: it arms the controller's internal DMA over a caller buffer,
//! starts the command, and turns the controller's interrupts into a result
//! code and response words for the caller.
//!
//! The engine is split into the pieces a firmware port wires together:
//!
//! - [`drivers::sdmmc::HostAdapter`] translates engine operations into
//!   register writes. [`drivers::sdmmc::dw_mmc::DwMmcHost`] implements it
//!   for DesignWare-derived controllers.
//! - [`time::Clock`] supplies time and the cooperative wait used while a
//!   caller blocks on hardware events.
//! - [`drivers::sdmmc::SdmmcHost`] owns per-slot state and exposes
//!   `execute()` to callers and `handle_interrupt()` to the interrupt vector.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![allow(unsafe_op_in_unsafe_fn)]

pub mod drivers;
pub mod logger;
pub mod time;

pub use drivers::sdmmc::{Command, CommandFlags, EngineConfig, HostAdapter, SdmmcError, SdmmcHost};
pub use time::{Clock, Timeout};
