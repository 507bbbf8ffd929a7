//! Derived climate metrics.
//!
//! Saturation vapor pressure uses the Tetens approximation
//! `es(T) = 0.6107 * exp(17.27 * T / (T + 237.3))` in kPa. It is strictly
//! increasing in T across the plausible band, and the same inputs always
//! produce bit-identical outputs.

use crate::config::Quantity;
use crate::sensor::Sample;
use crate::timestamp::Timestamp;

// Constants
const TETENS_A: f32 = 0.6107; // in kPa
const TETENS_B: f32 = 17.27;
const TETENS_C: f32 = 237.3; // in °C

pub const DEFAULT_MIN_PLAUSIBLE_TEMP: f32 = -40.0; // in °C
pub const DEFAULT_MAX_PLAUSIBLE_TEMP: f32 = 80.0; // in °C

/// Temperatures outside this band are treated as sensor faults.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PlausibleBand {
    pub min_temperature: f32,
    pub max_temperature: f32,
}

impl Default for PlausibleBand {
    fn default() -> Self {
        Self {
            min_temperature: DEFAULT_MIN_PLAUSIBLE_TEMP,
            max_temperature: DEFAULT_MAX_PLAUSIBLE_TEMP,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Reading {
    pub temperature: f32, // in °C
    pub humidity: f32,    // in %RH
    pub vpd: f32,         // in kPa
    pub computed_at: Timestamp,
}

impl Reading {
    pub fn value(&self, quantity: Quantity) -> f32 {
        match quantity {
            Quantity::Temperature => self.temperature,
            Quantity::Humidity => self.humidity,
            Quantity::Vpd => self.vpd,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InvalidReason {
    SensorFault,
    NotFinite,
    HumidityOutOfRange,
    TemperatureOutOfRange,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Metrics {
    Valid(Reading),
    Invalid(InvalidReason),
}

impl Metrics {
    pub fn reading(&self) -> Option<&Reading> {
        match self {
            Metrics::Valid(reading) => Some(reading),
            Metrics::Invalid(_) => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Metrics::Valid(_))
    }
}

/// Saturation vapor pressure over water in kPa.
pub fn saturation_vapor_pressure(temperature: f32) -> f32 {
    TETENS_A * libm::expf(TETENS_B * temperature / (temperature + TETENS_C))
}

/// Vapor pressure deficit in kPa, never negative.
pub fn vapor_pressure_deficit(temperature: f32, humidity: f32) -> f32 {
    let vpd = saturation_vapor_pressure(temperature) * (1.0 - humidity / 100.0);
    vpd.max(0.0)
}

/// Validate a sample and compute its derived metrics.
pub fn derive(sample: &Sample, band: &PlausibleBand) -> Metrics {
    if !sample.valid {
        return Metrics::Invalid(InvalidReason::SensorFault);
    }
    let Sample { temperature, humidity, timestamp, .. } = *sample;
    if !temperature.is_finite() || !humidity.is_finite() {
        return Metrics::Invalid(InvalidReason::NotFinite);
    }
    if !(0.0..=100.0).contains(&humidity) {
        return Metrics::Invalid(InvalidReason::HumidityOutOfRange);
    }
    if temperature < band.min_temperature || temperature > band.max_temperature {
        return Metrics::Invalid(InvalidReason::TemperatureOutOfRange);
    }
    Metrics::Valid(Reading {
        temperature,
        humidity,
        vpd: vapor_pressure_deficit(temperature, humidity),
        computed_at: timestamp,
    })
}

pub fn fahrenheit(celsius: f32) -> f32 {
    celsius * 9.0 / 5.0 + 32.0
}

/// Growing-conditions rating of a VPD value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VpdStatus {
    TooLow,
    Ideal,
    Good,
    Acceptable,
    TooHigh,
}

impl VpdStatus {
    pub fn classify(vpd: f32) -> Self {
        if vpd < 0.4 {
            VpdStatus::TooLow
        } else if vpd <= 0.8 {
            VpdStatus::Ideal
        } else if vpd <= 1.2 {
            VpdStatus::Good
        } else if vpd <= 1.6 {
            VpdStatus::Acceptable
        } else {
            VpdStatus::TooHigh
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            VpdStatus::TooLow => "Too Low",
            VpdStatus::Ideal => "Ideal",
            VpdStatus::Good => "Good",
            VpdStatus::Acceptable => "Acceptable",
            VpdStatus::TooHigh => "Too High",
        }
    }

    pub fn advice(&self) -> &'static str {
        match self {
            VpdStatus::TooLow => "Increase temperature or decrease humidity",
            VpdStatus::Ideal => "Perfect conditions for most plants",
            VpdStatus::Good => "Good for vegetative growth",
            VpdStatus::Acceptable => "OK for flowering stage",
            VpdStatus::TooHigh => "Decrease temperature or increase humidity",
        }
    }
}
