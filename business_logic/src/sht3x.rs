//! Driver for an SHT3x-compatible temperature/humidity sensor on I2C.
//!
//! The sensor is powered through an active-low enable line and switched off
//! between readings. Each reading is a single-shot, high-repeatability
//! measurement returning two CRC-protected 16-bit words.

use embedded_hal::digital::OutputPin;
use embedded_hal_async::{delay::DelayNs, i2c::I2c};

use crate::sensor::{Measurement, SensorError, SensorReader};

pub const DEFAULT_ADDRESS: u8 = 0x44; // ADDR pin tied low.
const MEASURE_HIGH_REPEATABILITY: [u8; 2] = [0x24, 0x00]; // No clock stretching.
const POWER_UP_MS: u32 = 1;
const CONVERSION_MS: u32 = 16;

const CRC_POLYNOMIAL: u8 = 0x31;
const CRC_INIT: u8 = 0xFF;

pub struct Sht3x<I2C, P, D> {
    i2c: I2C,
    address: u8,
    enable_bar: P,
    delay: D,
}

impl<I2C, P, D> Sht3x<I2C, P, D> {
    pub fn new(i2c: I2C, address: u8, enable_bar: P, delay: D) -> Self {
        Self { i2c, address, enable_bar, delay }
    }
}

impl<I2C, P, D> Sht3x<I2C, P, D>
where
    I2C: I2c,
    D: DelayNs,
{
    async fn convert(&mut self) -> Result<Measurement, SensorError> {
        self.i2c
            .write(self.address, &MEASURE_HIGH_REPEATABILITY)
            .await
            .map_err(|_| SensorError::Bus)?;
        self.delay.delay_ms(CONVERSION_MS).await;
        let mut frame = [0u8; 6];
        self.i2c
            .read(self.address, &mut frame)
            .await
            .map_err(|_| SensorError::Bus)?;
        decode_frame(&frame)
    }
}

impl<I2C, P, D> SensorReader for Sht3x<I2C, P, D>
where
    I2C: I2c,
    P: OutputPin,
    D: DelayNs,
{
    async fn measure(&mut self) -> Result<Measurement, SensorError> {
        self.enable_bar.set_low().map_err(|_| SensorError::Bus)?; // Enable the sensor.
        self.delay.delay_ms(POWER_UP_MS).await;
        let result = self.convert().await;
        self.power_down(); // Even after a failed transfer.
        result
    }

    fn power_down(&mut self) {
        let _ = self.enable_bar.set_high();
    }
}

/// CRC-8 as used by Sensirion sensors (polynomial 0x31, init 0xFF).
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = CRC_INIT;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ CRC_POLYNOMIAL
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Decode a 6-byte measurement frame: temperature word, CRC, humidity word, CRC.
pub fn decode_frame(frame: &[u8; 6]) -> Result<Measurement, SensorError> {
    let (t_word, rh_word) = frame.split_at(3);
    if crc8(&t_word[..2]) != t_word[2] || crc8(&rh_word[..2]) != rh_word[2] {
        return Err(SensorError::Checksum);
    }
    let raw_t = f32::from(u16::from_be_bytes([t_word[0], t_word[1]]));
    let raw_rh = f32::from(u16::from_be_bytes([rh_word[0], rh_word[1]]));
    Ok(Measurement {
        temperature: -45.0 + 175.0 * raw_t / 65535.0,
        humidity: 100.0 * raw_rh / 65535.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;
    use embassy_futures::block_on;
    use embassy_futures::select::{Either, select};
    use embedded_hal_async::i2c::{ErrorKind, ErrorType, Operation};

    fn frame(raw_t: u16, raw_rh: u16) -> [u8; 6] {
        let t = raw_t.to_be_bytes();
        let rh = raw_rh.to_be_bytes();
        [t[0], t[1], crc8(&t), rh[0], rh[1], crc8(&rh)]
    }

    struct FakeBus {
        frame: [u8; 6],
        nack: bool,
        writes: usize,
    }

    impl ErrorType for FakeBus {
        type Error = ErrorKind;
    }

    impl I2c for FakeBus {
        async fn transaction(
            &mut self,
            address: u8,
            operations: &mut [Operation<'_>],
        ) -> Result<(), Self::Error> {
            assert_eq!(address, DEFAULT_ADDRESS);
            if self.nack {
                return Err(ErrorKind::Other);
            }
            for op in operations {
                match op {
                    Operation::Write(bytes) => {
                        assert_eq!(*bytes, &MEASURE_HIGH_REPEATABILITY[..]);
                        self.writes += 1;
                    }
                    Operation::Read(buf) => buf.copy_from_slice(&self.frame),
                }
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct EnablePin {
        low: bool,
        toggles: usize,
    }

    impl embedded_hal::digital::ErrorType for EnablePin {
        type Error = Infallible;
    }

    impl OutputPin for EnablePin {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.low = true;
            self.toggles += 1;
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            self.low = false;
            self.toggles += 1;
            Ok(())
        }
    }

    struct NoDelay;

    impl DelayNs for NoDelay {
        async fn delay_ns(&mut self, _ns: u32) {}
    }

    /// A delay that never elapses, like a conversion that hangs.
    struct StalledDelay;

    impl DelayNs for StalledDelay {
        async fn delay_ns(&mut self, _ns: u32) {
            core::future::pending::<()>().await
        }
    }

    #[test]
    fn test_crc_reference_value() {
        // Example from the Sensirion datasheet.
        assert_eq!(crc8(&[0xBE, 0xEF]), 0x92);
    }

    #[test]
    fn test_decode_frame() {
        let m = decode_frame(&frame(0x6666, 0x8000)).unwrap();
        assert!((m.temperature - 25.0).abs() < 0.01);
        assert!((m.humidity - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_decode_rejects_bad_crc() {
        let mut bytes = frame(0x6666, 0x8000);
        bytes[5] ^= 0x01;
        assert_eq!(decode_frame(&bytes), Err(SensorError::Checksum));
        let mut bytes = frame(0x6666, 0x8000);
        bytes[0] ^= 0x80;
        assert_eq!(decode_frame(&bytes), Err(SensorError::Checksum));
    }

    #[test]
    fn test_measure_powers_sensor_down_afterwards() {
        let bus = FakeBus { frame: frame(0x6666, 0x8000), nack: false, writes: 0 };
        let mut sensor = Sht3x::new(bus, DEFAULT_ADDRESS, EnablePin::default(), NoDelay);
        let m = block_on(sensor.measure()).unwrap();
        assert!((m.temperature - 25.0).abs() < 0.01);
        assert_eq!(sensor.i2c.writes, 1);
        assert!(!sensor.enable_bar.low);
        assert_eq!(sensor.enable_bar.toggles, 2);
    }

    #[test]
    fn test_bus_error_still_powers_down() {
        let bus = FakeBus { frame: [0; 6], nack: true, writes: 0 };
        let mut sensor = Sht3x::new(bus, DEFAULT_ADDRESS, EnablePin::default(), NoDelay);
        assert_eq!(block_on(sensor.measure()), Err(SensorError::Bus));
        assert!(!sensor.enable_bar.low);
    }

    #[test]
    fn test_abandoned_read_can_power_down() {
        let bus = FakeBus { frame: frame(0x6666, 0x8000), nack: false, writes: 0 };
        let mut sensor = Sht3x::new(bus, DEFAULT_ADDRESS, EnablePin::default(), StalledDelay);
        let outcome = block_on(select(sensor.measure(), core::future::ready(())));
        assert!(matches!(outcome, Either::Second(())));
        assert!(sensor.enable_bar.low); // Dropped while powered.
        assert_eq!(sensor.i2c.writes, 0);

        sensor.power_down();
        assert!(!sensor.enable_bar.low);
    }
}
