//! Hardware-independent core of the greenhouse monitor: sensor sampling,
//! VPD calculation, alarm hysteresis, notification cooldown, and the bounded
//! statistics the dashboard reads.
#![cfg_attr(not(test), no_std)]

mod fmt;

pub mod alarm;
pub mod config;
pub mod metrics;
pub mod monitor;
pub mod notification;
pub mod ring;
pub mod scheduler;
pub mod sensor;
pub mod sht3x;
pub mod stats;
pub mod timestamp;
