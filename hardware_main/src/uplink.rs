//! Request link to the network co-processor that serves the web dashboard.
//!
//! One request per line: `STATUS`, `HISTORY`, `ALERTS`, `CONFIG`, `SYSTEM`,
//! or `POST <form body>`. Replies are `key=value` lines ending in `END`, or
//! a single `ERR <message>` line. State is copied out of the monitor under
//! the lock and written to the link afterwards.

use arrayvec::ArrayString;
use core::fmt::Write;
use embassy_stm32::mode::Async;
use embassy_stm32::usart::{self, Uart};
use embassy_sync::blocking_mutex::raw::ThreadModeRawMutex;
use embassy_sync::channel::Sender;

use business_logic::config::Quantity;
use business_logic::metrics::{Metrics, fahrenheit};
use business_logic::monitor::FollowUp;
use business_logic::notification::Envelope;
use business_logic::scheduler::{Clock, SharedMonitor};
use crate::fmt::{info, warn};
use crate::health::device_health;
use crate::rtclock::Rtclock;
use crate::settings_store::SettingsStore;

pub const OUTBOX_DEPTH: usize = 4;
const REQUEST_LEN: usize = 512;
const LINE_LEN: usize = 160;

type Line = ArrayString<LINE_LEN>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Request<'a> {
    Status,
    History,
    Alerts,
    Config,
    System,
    Post(&'a str),
}

impl<'a> Request<'a> {
    pub fn parse(line: &'a str) -> Option<Self> {
        let line = line.trim();
        let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
        match verb {
            "STATUS" => Some(Request::Status),
            "HISTORY" => Some(Request::History),
            "ALERTS" => Some(Request::Alerts),
            "CONFIG" => Some(Request::Config),
            "SYSTEM" => Some(Request::System),
            "POST" => Some(Request::Post(rest)),
            _ => None,
        }
    }
}

pub struct Uplink {
    uart: Uart<'static, Async>,
    monitor: &'static SharedMonitor<ThreadModeRawMutex>,
    outbox: Sender<'static, ThreadModeRawMutex, Envelope, OUTBOX_DEPTH>,
    clock: &'static Rtclock,
    store: SettingsStore,
}

impl Uplink {
    pub fn new(
        uart: Uart<'static, Async>,
        monitor: &'static SharedMonitor<ThreadModeRawMutex>,
        outbox: Sender<'static, ThreadModeRawMutex, Envelope, OUTBOX_DEPTH>,
        clock: &'static Rtclock,
        store: SettingsStore,
    ) -> Self {
        Self { uart, monitor, outbox, clock, store }
    }

    /// Serve one request. Returns true when the caller should restart the
    /// device.
    pub async fn serve_one(&mut self) -> Result<bool, usart::Error> {
        let mut buf = [0u8; REQUEST_LEN];
        let n = self.uart.read_until_idle(&mut buf).await?;
        let Ok(text) = core::str::from_utf8(&buf[..n]) else {
            self.line(format_args!("ERR not utf-8")).await?;
            return Ok(false);
        };
        match Request::parse(text) {
            Some(Request::Status) => self.status().await?,
            Some(Request::History) => self.history().await?,
            Some(Request::Alerts) => self.alerts().await?,
            Some(Request::Config) => self.config().await?,
            Some(Request::System) => self.system().await?,
            Some(Request::Post(body)) => return self.post(body).await,
            None => self.line(format_args!("ERR unknown request")).await?,
        }
        Ok(false)
    }

    async fn line(&mut self, args: core::fmt::Arguments<'_>) -> Result<(), usart::Error> {
        let mut line = Line::new();
        if line.write_fmt(args).is_err() {
            warn!("uplink line truncated");
        }
        self.uart.write(line.as_bytes()).await?;
        self.uart.write(b"\n").await
    }

    async fn end(&mut self) -> Result<(), usart::Error> {
        self.uart.write(b"END\n").await
    }

    async fn status(&mut self) -> Result<(), usart::Error> {
        let now = self.clock.now();
        let snapshot = self.monitor.lock(|cell| cell.borrow().snapshot(now));
        self.line(format_args!("time={}", now.seconds)).await?;
        self.line(format_args!("uptime={}", snapshot.uptime.create_iso8601_str())).await?;
        self.line(format_args!("degraded={}", u8::from(snapshot.degraded))).await?;
        if let Some(Metrics::Valid(reading)) = snapshot.metrics {
            self.line(format_args!("temperature={:.1}", reading.temperature)).await?;
            self.line(format_args!("temperature_f={:.1}", fahrenheit(reading.temperature))).await?;
            self.line(format_args!("humidity={:.1}", reading.humidity)).await?;
            self.line(format_args!("vpd={:.2}", reading.vpd)).await?;
        }
        if let Some(status) = snapshot.vpd_status {
            self.line(format_args!("vpd_status={}", status.label())).await?;
            self.line(format_args!("vpd_advice={}", status.advice())).await?;
        }
        for quantity in Quantity::ALL {
            let state = snapshot.alarms[quantity.index()];
            let threshold = snapshot.thresholds.threshold(quantity);
            self.line(format_args!(
                "alarm_{}={},{},{},{}",
                quantity.key(),
                state.level.label(),
                state.since.seconds,
                threshold.min,
                threshold.max
            ))
            .await?;
            if let Some(span) = snapshot.extrema[quantity.index()] {
                self.line(format_args!("extrema_{}={},{}", quantity.key(), span.min, span.max)).await?;
            }
        }
        let counters = snapshot.counters;
        self.line(format_args!("total_reads={}", counters.total_reads)).await?;
        self.line(format_args!("error_count={}", counters.error_count)).await?;
        self.line(format_args!("rejected_count={}", counters.rejected_count)).await?;
        self.line(format_args!("notifications={}", if snapshot.notifications_enabled { "on" } else { "off" }))
            .await?;
        self.end().await
    }

    async fn history(&mut self) -> Result<(), usart::Error> {
        let (history, summary) = self
            .monitor
            .lock(|cell| {
                let monitor = cell.borrow();
                (monitor.history(), monitor.session_summary())
            });
        for s in &history.samples {
            self.line(format_args!(
                "sample={},{:.1},{:.1},{}",
                s.timestamp.seconds,
                s.temperature,
                s.humidity,
                u8::from(s.valid)
            ))
            .await?;
        }
        if let Some(summary) = summary {
            for quantity in Quantity::ALL {
                let q = summary.get(quantity);
                self.line(format_args!("summary_{}={},{},{}", quantity.key(), q.min, q.max, q.mean)).await?;
            }
        }
        self.end().await
    }

    async fn alerts(&mut self) -> Result<(), usart::Error> {
        let records = self.monitor.lock(|cell| cell.borrow().notifications());
        for r in records.iter().rev() {
            self.line(format_args!(
                "alert={},{},{},{},{},{}",
                r.sent_at.seconds,
                r.quantity.map_or("test", |q| q.key()),
                r.from.label(),
                r.to.label(),
                if r.success { "sent" } else { "failed" },
                r.attempts
            ))
            .await?;
        }
        self.end().await
    }

    async fn config(&mut self) -> Result<(), usart::Error> {
        let encoded = self.monitor.lock(|cell| cell.borrow().settings().encode(false));
        match encoded {
            Ok(record) => {
                self.uart.write(record.as_bytes()).await?;
                self.end().await
            }
            Err(err) => self.line(format_args!("ERR {}", err.message())).await,
        }
    }

    async fn system(&mut self) -> Result<(), usart::Error> {
        let now = self.clock.now();
        let view = self.monitor.lock(|cell| cell.borrow().system_view(device_health(), now));
        self.line(format_args!("free_memory={}", view.health.free_memory_bytes)).await?;
        self.line(format_args!("cpu_frequency={}", view.health.cpu_frequency_hz)).await?;
        self.line(format_args!("device_uptime={}", view.health.uptime_seconds)).await?;
        self.line(format_args!("uptime={}", view.uptime.create_iso8601_str())).await?;
        self.line(format_args!("total_reads={}", view.counters.total_reads)).await?;
        self.line(format_args!("error_count={}", view.counters.error_count)).await?;
        self.line(format_args!("history={}/{}", view.history_len, view.history_capacity)).await?;
        self.line(format_args!("alerts={}", view.notification_count)).await?;
        self.line(format_args!("sample_interval={}", view.sample_interval_seconds)).await?;
        self.end().await
    }

    async fn post(&mut self, body: &str) -> Result<bool, usart::Error> {
        let now = self.clock.now();
        let outbox = &mut self.outbox;
        let result = self.monitor.lock(|cell| {
            let mut monitor = cell.borrow_mut();
            let action = monitor.apply_form(body).map_err(|err| err.message())?;
            match action {
                Some(action) => monitor
                    .run_action(action, now, outbox)
                    .map_err(|_| "could not queue test email"),
                None => Ok(FollowUp::Nothing),
            }
        });
        match result {
            Ok(FollowUp::Nothing) => {}
            Ok(FollowUp::Persist(settings)) => {
                if self.store.save(&settings).is_err() {
                    return self.line(format_args!("ERR settings not saved")).await.map(|_| false);
                }
            }
            Ok(FollowUp::Restart) => {
                info!("restart requested over uplink");
                self.line(format_args!("ok=restarting")).await?;
                self.end().await?;
                return Ok(true);
            }
            Err(message) => {
                return self.line(format_args!("ERR {}", message)).await.map(|_| false);
            }
        }
        self.line(format_args!("ok=1")).await?;
        self.end().await?;
        Ok(false)
    }
}
