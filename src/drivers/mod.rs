//! Hardware drivers
//!
//! This module contains the storage controller drivers built on top of the
//! platform's register access and interrupt plumbing.

pub mod sdmmc;
