//! Raw samples and the reader abstraction polled once per tick.

use crate::fmt::warn;
use crate::timestamp::Timestamp;

/// One raw reading. `valid` is false when the sensor could not be read; the
/// numeric fields are then zero and carry no meaning.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sample {
    pub timestamp: Timestamp,
    pub temperature: f32, // in °C
    pub humidity: f32,    // in %RH
    pub valid: bool,
}

impl Sample {
    pub fn new(timestamp: Timestamp, temperature: f32, humidity: f32) -> Self {
        Self { timestamp, temperature, humidity, valid: true }
    }

    pub fn failed(timestamp: Timestamp) -> Self {
        Self { timestamp, temperature: 0.0, humidity: 0.0, valid: false }
    }
}

/// Converted sensor output, before any plausibility checks.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Measurement {
    pub temperature: f32,
    pub humidity: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorError {
    /// The bus transaction did not finish in time.
    Timeout,
    /// The device did not acknowledge or the bus reported an error.
    Bus,
    /// A data word failed its CRC.
    Checksum,
}

#[allow(async_fn_in_trait)]
pub trait SensorReader {
    /// Perform one bounded bus transaction.
    async fn measure(&mut self) -> Result<Measurement, SensorError>;

    /// Return the device to its idle state after a read was abandoned part
    /// way through.
    fn power_down(&mut self) {}

    /// Read the sensor, turning any failure into an invalid sample so the
    /// caller never has to handle an error.
    async fn sample(&mut self, now: Timestamp) -> Sample {
        match self.measure().await {
            Ok(Measurement { temperature, humidity }) => Sample::new(now, temperature, humidity),
            Err(err) => {
                warn!("sensor read failed at {}: {}", now.seconds, err);
                Sample::failed(now)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;

    struct Scripted {
        results: [Result<Measurement, SensorError>; 2],
        next: usize,
    }

    impl SensorReader for Scripted {
        async fn measure(&mut self) -> Result<Measurement, SensorError> {
            let result = self.results[self.next % self.results.len()];
            self.next += 1;
            result
        }
    }

    #[test]
    fn test_failures_become_invalid_samples() {
        let mut sensor = Scripted {
            results: [
                Ok(Measurement { temperature: 21.5, humidity: 48.0 }),
                Err(SensorError::Checksum),
            ],
            next: 0,
        };
        let t0 = Timestamp { seconds: 10 };
        let t1 = Timestamp { seconds: 15 };

        let good = block_on(sensor.sample(t0));
        assert_eq!(good, Sample::new(t0, 21.5, 48.0));
        assert!(good.valid);

        let bad = block_on(sensor.sample(t1));
        assert!(!bad.valid);
        assert_eq!(bad.timestamp, t1);
    }
}
