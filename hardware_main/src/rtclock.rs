use core::cell::Cell;

use embassy_stm32::rtc::{DateTime, DayOfWeek, Rtc};
use embassy_time::{Duration, Ticker};

use business_logic::scheduler::{Clock, TickSource};
use business_logic::timestamp::Timestamp;
use crate::fmt::warn;

const RTC_BACKUP_KEY_INDEX: usize = 0; // Index to RTC backup register where key is stored
const RTC_BACKUP_RTCW_INDEX: usize = 1; // Index to RTC backup register where RTCW is stored
const RTC_BACKUP_KEY_VALUE: u32 = 0xA53C4B69; // Value stored at RTC_BACKUP_KEY_INDEX if RTCW value is good
const EMBASSY_DATETIME_OFFSET: u16 = 2000; // embassy-stm32 years are 2000-2099, the RTC holds 0-99.

/// Seconds since the computational epoch (year 0, March 1st), read from the RTC.
pub struct Rtclock {
    rtc: Rtc,
    rtcw: u32,
    last_seconds: Cell<u32>, // Returned when the RTC cannot be read.
}

impl Rtclock {
    /// Wrap an RTC that kept running through the last reset.
    pub fn from_running(rtc: Rtc) -> Self {
        let rtcw = rtc.read_backup_register(RTC_BACKUP_RTCW_INDEX).unwrap_or(0);
        let clock = Self { rtc, rtcw, last_seconds: Cell::new(rtcw) };
        clock.last_seconds.set(clock.get_timestamp().seconds);
        clock
    }

    /// Start the RTC at `rtcw`, after a power loss.
    pub fn from_rtcw(mut rtc: Rtc, rtcw: u32) -> Self {
        rtc.write_backup_register(RTC_BACKUP_RTCW_INDEX, rtcw);
        rtc.write_backup_register(RTC_BACKUP_KEY_INDEX, RTC_BACKUP_KEY_VALUE);
        match Rtclock::seconds_to_datetime(rtcw) {
            Some(dt) => {
                if rtc.set_datetime(dt).is_err() {
                    warn!("RTC rejected start time {}", rtcw);
                }
            }
            None => warn!("no calendar date for {} s", rtcw),
        }
        Self { rtc, rtcw, last_seconds: Cell::new(rtcw) }
    }

    pub fn get_timestamp(&self) -> Timestamp {
        let seconds = self
            .rtc
            .now()
            .ok()
            .and_then(Rtclock::datetime_to_seconds)
            .unwrap_or_else(|| {
                warn!("RTC read failed, reusing {}", self.last_seconds.get());
                self.last_seconds.get()
            });
        self.last_seconds.set(seconds);
        Timestamp { seconds }
    }

    /// Get RTCWake, the value of RELT at the last "brownout" event.
    pub fn get_rtcw(&self) -> u32 {
        self.rtcw
    }

    /// Check if the RTC is running.
    pub fn is_running(rtc: &Rtc) -> bool {
        rtc.read_backup_register(RTC_BACKUP_KEY_INDEX).unwrap_or(0) == RTC_BACKUP_KEY_VALUE
    }

    /// Convert seconds since the epoch (0, 3, 1) to a DateTime.
    pub fn seconds_to_datetime(seconds: u32) -> Option<DateTime> {
        let (days, hour, minute, second) = Timestamp { seconds }.to_dhms();

        // Days since March 1, 0000 to a Julian calendar date, following
        // Neri C, Schneider L. "Euclidean affine functions and their application
        // to calendar algorithms". Softw Pract Exper. 2022;1-34. doi: 10.1002/spe.3172.
        // Variable names follow Section 5 of the paper.
        let n_1 = 4 * days + 3; // N1
        let year_computational = n_1 / 1461; // Y
        let n_y = n_1 % 1461 / 4; // N_Y
        let n_2 = 5 * n_y + 461; // N_2
        let m = n_2 / 153; // M
        let day_julian = (n_2 % 153 / 5 + 1) as u8; // D_J
        let j = u32::from(m >= 13); // J = 1{M>=13}
        let month_julian = (m - 12 * j) as u8; // M_J
        let year_julian = u16::try_from(year_computational + j).ok()? + EMBASSY_DATETIME_OFFSET;

        // Day of week is unused.
        DateTime::from(
            year_julian,
            month_julian,
            day_julian,
            DayOfWeek::Monday,
            hour as u8,
            minute as u8,
            second as u8,
        )
        .ok()
    }

    /// Convert a DateTime to seconds since the epoch (0, 3, 1).
    pub fn datetime_to_seconds(datetime: DateTime) -> Option<u32> {
        let year: u32 = (datetime.year() % 100).into();
        let month: u32 = datetime.month().into();
        if year == 0 && month < 3 {
            // Before the epoch; the RTC is never started that early.
            return None;
        }
        let day: u32 = datetime.day().into();
        let hour: u32 = datetime.hour().into();
        let minute: u32 = datetime.minute().into();
        let second: u32 = datetime.second().into();

        // The computational calendar starts on March 1st.
        let j = u32::from(month <= 2);
        let y = year - j;
        let m = month + 12 * j;
        let d = day - 1;

        let days_since_epoch = 1461 * y / 4 + (153 * m - 457) / 5 + d;
        Some(days_since_epoch * 86400 + hour * 3600 + minute * 60 + second)
    }
}

impl Clock for Rtclock {
    fn now(&self) -> Timestamp {
        self.get_timestamp()
    }
}

/// Paces the sampling loop, stamping each tick from the RTC.
pub struct SampleTicker<'a> {
    clock: &'a Rtclock,
    ticker: Option<(u32, Ticker)>,
}

impl<'a> SampleTicker<'a> {
    pub fn new(clock: &'a Rtclock) -> Self {
        Self { clock, ticker: None }
    }
}

impl TickSource for SampleTicker<'_> {
    async fn next_tick(&mut self, interval_seconds: u32) -> Timestamp {
        // Restart the ticker when the configured interval changes.
        let ticker = match &mut self.ticker {
            Some((current, ticker)) if *current == interval_seconds => ticker,
            slot => {
                let ticker = Ticker::every(Duration::from_secs(u64::from(interval_seconds)));
                &mut slot.insert((interval_seconds, ticker)).1
            }
        };
        ticker.next().await;
        self.clock.get_timestamp()
    }
}
