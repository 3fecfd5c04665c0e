//! Core domain model types for epicflow.
//!
//! This module contains the fundamental types used throughout the controller:
//! - Observation identity and terminal status
//! - Exposure prefixes, lifecycle status and per-exposure state
//! - CCD / quadrant usability vectors

mod exposure;
mod observation;
mod usability;

pub use exposure::{
    BackgroundState, DetectorFamily, Exposure, ExposurePrefix, ExposureStatus, MaskState,
    ScheduleFlag,
};
pub use observation::{Observation, ObservationId, ObservationStatus, MIN_REVOLUTION};
pub use usability::{UsabilityVector, MOS_CCD_COUNT, PN_QUADRANT_COUNT};
