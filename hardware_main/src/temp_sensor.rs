//! The greenhouse temperature/humidity sensor: an SHT3x on I2C1, powered
//! through an active-low enable line, with every read bounded in time.

use embassy_stm32::gpio::Output;
use embassy_stm32::i2c::I2c;
use embassy_stm32::mode::Async;
use embassy_time::{Delay, Duration, with_timeout};

use business_logic::sensor::{Measurement, SensorError, SensorReader};
use business_logic::sht3x::Sht3x;

pub const SENSOR_ADDRESS: u8 = business_logic::sht3x::DEFAULT_ADDRESS;
pub const READ_TIMEOUT: Duration = Duration::from_millis(100); // Conversion takes about 16 ms.

pub type GreenhouseSensor = TimedSensor<Sht3x<I2c<'static, Async>, Output<'static>, Delay>>;

pub fn greenhouse_sensor(i2c: I2c<'static, Async>, enable_bar: Output<'static>) -> GreenhouseSensor {
    TimedSensor::new(Sht3x::new(i2c, SENSOR_ADDRESS, enable_bar, Delay), READ_TIMEOUT)
}

/// Gives up on a read that has not finished within `timeout` and powers the
/// sensor down.
pub struct TimedSensor<S> {
    inner: S,
    timeout: Duration,
}

impl<S> TimedSensor<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl<S: SensorReader> SensorReader for TimedSensor<S> {
    async fn measure(&mut self) -> Result<Measurement, SensorError> {
        match with_timeout(self.timeout, self.inner.measure()).await {
            Ok(result) => result,
            Err(_) => {
                // The read was dropped before it could switch the sensor off.
                self.inner.power_down();
                Err(SensorError::Timeout)
            }
        }
    }

    fn power_down(&mut self) {
        self.inner.power_down();
    }
}
