//! # Host-side Simulation Kit
//!
//! In-memory stand-ins for the firmware and the relocator, plus builders for
//! small kernel images and readers for the structures the loader leaves in
//! memory. Everything here runs on the host, so the whole load and handoff
//! path can be exercised without real hardware.

mod platform;
mod relocator;

pub mod images;
pub mod inspect;

pub use platform::SimPlatform;
pub use relocator::SimRelocator;
