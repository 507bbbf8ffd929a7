//! The monitor ties the pipeline together: it owns the active settings, the
//! alarm states, the statistics, and the notification log, and runs one tick
//! of sample -> derive -> record -> evaluate -> consider at a time.
//!
//! Readers get copies (`DashboardSnapshot`, `SystemView`, ...) so nothing
//! outside the monitor ever holds a reference into state a tick is updating.

use arrayvec::ArrayVec;

use crate::alarm::{AlarmEngine, AlarmState, Transitions};
use crate::config::{AlarmConfig, ConfigAction, ConfigError, QUANTITY_COUNT, Quantity, Settings};
use crate::fmt::{debug, info, warn};
use crate::metrics::{self, Metrics, VpdStatus};
use crate::notification::{
    DeliveryOutcome, Envelope, EnvelopeKind, NOTIFICATION_LOG_CAPACITY, NotificationGate, NotificationLog,
    NotificationRecord, Outbox, TransportError,
};
use crate::sensor::Sample;
use crate::stats::{Counters, HISTORY_CAPACITY, SessionSummary, Span, StatsSnapshot, StatsStore};
use crate::timestamp::Timestamp;

/// What one tick did.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub sample: Sample,
    pub metrics: Metrics,
    pub transitions: Transitions,
    pub queued: u8,  // Envelopes handed to the outbox.
    pub dropped: u8, // Sends that could not be queued.
}

/// Read-only facts about the device, supplied by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceHealth {
    pub free_memory_bytes: u32,
    pub cpu_frequency_hz: u32,
    pub uptime_seconds: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DashboardSnapshot {
    pub taken_at: Timestamp,
    pub metrics: Option<Metrics>,
    pub vpd_status: Option<VpdStatus>,
    pub alarms: [AlarmState; QUANTITY_COUNT],
    pub thresholds: AlarmConfig,
    pub counters: Counters,
    pub uptime: Timestamp,
    pub extrema: [Option<Span>; QUANTITY_COUNT],
    pub notifications_enabled: bool,
    /// The last tick produced no usable reading.
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemView {
    pub health: DeviceHealth,
    pub counters: Counters,
    pub uptime: Timestamp,
    pub history_len: usize,
    pub history_capacity: usize,
    pub notification_count: usize,
    pub sample_interval_seconds: u32,
}

/// Work an action leaves for the platform to do.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FollowUp {
    Nothing,
    Persist(Settings),
    Restart,
}

pub struct Monitor {
    settings: Settings,
    alarms: AlarmEngine,
    stats: StatsStore<HISTORY_CAPACITY>,
    notifications: NotificationLog,
    last_metrics: Option<Metrics>,
    last_tick: Option<Timestamp>,
}

impl Monitor {
    pub fn new(settings: Settings, started_at: Timestamp) -> Self {
        Self {
            settings,
            alarms: AlarmEngine::new(started_at),
            stats: StatsStore::new(started_at),
            notifications: NotificationLog::new(),
            last_metrics: None,
            last_tick: None,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Replace the settings as a whole. Invalid settings are rejected and the
    /// current ones stay in force.
    pub fn apply_settings(&mut self, settings: Settings) -> Result<(), ConfigError> {
        if let Err(err) = settings.validate() {
            warn!("settings rejected: {}", err);
            return Err(err);
        }
        self.settings = settings;
        info!("settings applied");
        Ok(())
    }

    /// Apply a dashboard form. Returns the action it carried, if any.
    pub fn apply_form(&mut self, body: &str) -> Result<Option<ConfigAction>, ConfigError> {
        let update = self.settings.updated_from_form(body).inspect_err(|err| {
            warn!("form rejected: {}", err);
        })?;
        self.apply_settings(update.settings)?;
        Ok(update.action)
    }

    /// Run one tick for a sample that has already been read.
    pub fn tick(&mut self, sample: Sample, outbox: &mut impl Outbox) -> TickReport {
        let sample = self.advance_clock(sample);
        let now = sample.timestamp;
        let metrics = metrics::derive(&sample, &self.settings.plausible);

        self.stats.record(&sample);
        match &metrics {
            Metrics::Valid(reading) => self.stats.observe(reading),
            Metrics::Invalid(reason) if sample.valid => {
                debug!("implausible reading rejected: {}", reason);
                self.stats.note_rejected();
            }
            Metrics::Invalid(_) => {}
        }

        let transitions = self.alarms.evaluate(&metrics, &self.settings.alarm);
        let uptime = self.stats.uptime(now);
        let notify = &self.settings.notify;
        let gate = NotificationGate::new(notify);
        let mut queued = 0;
        let mut dropped = 0;
        for transition in &transitions {
            let state = self.alarms.state_mut(transition.quantity);
            if !gate.consider(transition, state, now).send {
                continue;
            }
            let envelope = Envelope::alert(transition, notify, uptime);
            let kind = envelope.kind;
            match outbox.post(envelope) {
                Ok(()) => queued += 1,
                Err(err) => {
                    warn!("{} alert not queued: {}", transition.quantity.label(), err);
                    self.notifications.push(NotificationRecord::new(kind, now, false, 0));
                    dropped += 1;
                }
            }
        }

        self.last_metrics = Some(metrics);
        TickReport { sample, metrics, transitions, queued, dropped }
    }

    /// Keep tick times non-decreasing. A sample stamped before the previous
    /// tick is re-stamped with the previous tick time.
    fn advance_clock(&mut self, mut sample: Sample) -> Sample {
        if let Some(last) = self.last_tick {
            if sample.timestamp.seconds_since(last).is_err() {
                warn!("tick at {} is earlier than {}, re-stamping", sample.timestamp.seconds, last.seconds);
                sample.timestamp = last;
            }
        }
        self.last_tick = Some(sample.timestamp);
        sample
    }

    /// Record how a queued envelope fared.
    pub fn record_delivery(&mut self, kind: EnvelopeKind, outcome: DeliveryOutcome, at: Timestamp) {
        if !outcome.success {
            warn!("mail not delivered after {} attempts", outcome.attempts);
        }
        self.notifications
            .push(NotificationRecord::new(kind, at, outcome.success, outcome.attempts));
    }

    /// Queue a test email. Does not touch any alarm cooldown.
    pub fn queue_test_message(&mut self, now: Timestamp, outbox: &mut impl Outbox) -> Result<(), TransportError> {
        let notify = &self.settings.notify;
        if !notify.is_active() {
            return Err(TransportError::Rejected);
        }
        let envelope = Envelope::test(notify, now, self.stats.uptime(now));
        outbox.post(envelope).inspect_err(|_| {
            self.notifications
                .push(NotificationRecord::new(EnvelopeKind::Test, now, false, 0));
        })
    }

    /// Carry out the parts of an action that live in the monitor.
    pub fn run_action(
        &mut self,
        action: ConfigAction,
        now: Timestamp,
        outbox: &mut impl Outbox,
    ) -> Result<FollowUp, TransportError> {
        match action {
            ConfigAction::ClearLog => self.clear_notifications(),
            ConfigAction::ResetStats => self.reset_statistics(),
            ConfigAction::TestEmail => self.queue_test_message(now, outbox)?,
            ConfigAction::Save => return Ok(FollowUp::Persist(self.settings)),
            ConfigAction::Restart => return Ok(FollowUp::Restart),
        }
        Ok(FollowUp::Nothing)
    }

    pub fn alarm_state(&self, quantity: Quantity) -> AlarmState {
        *self.alarms.state(quantity)
    }

    pub fn counters(&self) -> Counters {
        self.stats.counters()
    }

    pub fn snapshot(&self, now: Timestamp) -> DashboardSnapshot {
        let reading = self.last_metrics.as_ref().and_then(Metrics::reading);
        DashboardSnapshot {
            taken_at: now,
            metrics: self.last_metrics,
            vpd_status: reading.map(|r| VpdStatus::classify(r.vpd)),
            alarms: *self.alarms.states(),
            thresholds: self.settings.alarm,
            counters: self.stats.counters(),
            uptime: self.stats.uptime(now),
            extrema: Quantity::ALL.map(|q| self.stats.extrema(q)),
            notifications_enabled: self.settings.notify.is_active(),
            degraded: matches!(self.last_metrics, Some(Metrics::Invalid(_))),
        }
    }

    pub fn history(&self) -> StatsSnapshot<HISTORY_CAPACITY> {
        self.stats.snapshot()
    }

    pub fn recent_errors(&self) -> ArrayVec<Sample, HISTORY_CAPACITY> {
        self.stats.recent_errors().copied().collect()
    }

    /// Notification records, oldest first.
    pub fn notifications(&self) -> ArrayVec<NotificationRecord, NOTIFICATION_LOG_CAPACITY> {
        self.notifications.iter().copied().collect()
    }

    pub fn clear_notifications(&mut self) {
        self.notifications.clear();
        info!("notification log cleared");
    }

    /// Reset the all-time extrema. Read counters are monotonic and survive.
    pub fn reset_statistics(&mut self) {
        self.stats.reset_extrema();
        info!("statistics reset");
    }

    pub fn session_summary(&self) -> Option<SessionSummary> {
        self.stats.session_summary(&self.settings.plausible)
    }

    pub fn system_view(&self, health: DeviceHealth, now: Timestamp) -> SystemView {
        SystemView {
            health,
            counters: self.stats.counters(),
            uptime: self.stats.uptime(now),
            history_len: self.stats.history().count(),
            history_capacity: HISTORY_CAPACITY,
            notification_count: self.notifications.len(),
            sample_interval_seconds: self.settings.sample_interval_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::AlarmLevel;
    use crate::config::{Text, Threshold};

    type TestOutbox = ArrayVec<Envelope, 4>;

    fn at(seconds: u32) -> Timestamp {
        Timestamp { seconds }
    }

    fn alerting_settings() -> Settings {
        let mut settings = Settings::default();
        settings.alarm.temperature = Threshold::new(18.0, 28.0, 1.0);
        settings.alarm.vpd = Threshold::new(0.1, 5.0, 0.1);
        settings.alarm.warning_fraction = 0.0;
        settings.notify.enabled = true;
        settings.notify.cooldown_seconds = 3600;
        settings.notify.recipient = Text::from("grower@example.com").unwrap();
        settings.notify.account.username = Text::from("monitor@example.com").unwrap();
        settings
    }

    #[test]
    fn test_scenario_single_alert_for_excursion() {
        let mut monitor = Monitor::new(alerting_settings(), at(0));
        let mut outbox = TestOutbox::new();
        let temperatures = [29.0, 30.0, 27.5, 27.0];
        let mut reports = ArrayVec::<TickReport, 4>::new();
        for (i, temperature) in temperatures.into_iter().enumerate() {
            let sample = Sample::new(at(5 * (i as u32 + 1)), temperature, 50.0);
            reports.push(monitor.tick(sample, &mut outbox));
        }

        let first = &reports[0].transitions;
        assert_eq!(first.len(), 1);
        assert_eq!((first[0].from, first[0].to), (AlarmLevel::Ok, AlarmLevel::Danger));
        assert!(reports[1].transitions.is_empty());
        assert!(reports[2].transitions.is_empty());
        let last = &reports[3].transitions;
        assert_eq!(last.len(), 1);
        assert_eq!((last[0].from, last[0].to), (AlarmLevel::Danger, AlarmLevel::Ok));

        assert_eq!(outbox.len(), 1);
        assert_eq!(
            outbox[0].kind,
            EnvelopeKind::Alert { quantity: Quantity::Temperature, from: AlarmLevel::Ok, to: AlarmLevel::Danger }
        );
        assert_eq!(monitor.alarm_state(Quantity::Temperature).last_notified_at, Some(at(5)));
    }

    #[test]
    fn test_scenario_sensor_errors_then_valid_sample() {
        let mut monitor = Monitor::new(Settings::default(), at(0));
        let mut outbox = TestOutbox::new();
        for i in 1..=3 {
            let report = monitor.tick(Sample::failed(at(5 * i)), &mut outbox);
            assert!(report.transitions.is_empty());
            assert!(monitor.snapshot(at(5 * i)).degraded);
        }
        let report = monitor.tick(Sample::new(at(20), 22.0, 55.0), &mut outbox);
        assert!(report.transitions.is_empty());

        let counters = monitor.counters();
        assert_eq!(counters.error_count, 3);
        assert_eq!(counters.total_reads, 4);
        for quantity in Quantity::ALL {
            assert_eq!(monitor.alarm_state(quantity).level, AlarmLevel::Ok);
        }
        let snapshot = monitor.snapshot(at(20));
        assert!(!snapshot.degraded);
        assert_eq!(snapshot.vpd_status, Some(VpdStatus::Good));
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_invalid_settings_keep_previous() {
        let mut monitor = Monitor::new(Settings::default(), at(0));
        let mut bad = Settings::default();
        bad.alarm.temperature.min = 40.0;
        assert_eq!(monitor.apply_settings(bad), Err(ConfigError::Range(Quantity::Temperature)));
        assert_eq!(*monitor.settings(), Settings::default());

        assert_eq!(monitor.apply_form("temp_max=30&action=save"), Ok(Some(ConfigAction::Save)));
        assert_eq!(monitor.settings().alarm.temperature.max, 30.0);
    }

    #[test]
    fn test_new_thresholds_apply_on_next_tick() {
        let mut monitor = Monitor::new(Settings::default(), at(0));
        let mut outbox = TestOutbox::new();
        // 23 °C at 60 %RH is inside every default band (VPD about 1.12 kPa).
        assert!(monitor.tick(Sample::new(at(5), 23.0, 60.0), &mut outbox).transitions.is_empty());
        monitor.apply_form("temp_min=15&temp_max=22").unwrap();
        let report = monitor.tick(Sample::new(at(10), 23.0, 60.0), &mut outbox);
        assert_eq!(report.transitions.len(), 1);
        assert_eq!(report.transitions[0].quantity, Quantity::Temperature);
        assert_eq!(report.transitions[0].to, AlarmLevel::Danger);
    }

    #[test]
    fn test_full_outbox_is_recorded_and_cooldown_kept() {
        let mut monitor = Monitor::new(alerting_settings(), at(0));
        let mut outbox = ArrayVec::<Envelope, 0>::new();
        let report = monitor.tick(Sample::new(at(5), 35.0, 50.0), &mut outbox);
        assert_eq!((report.queued, report.dropped), (0, 1));
        let log = monitor.notifications();
        assert_eq!(log.len(), 1);
        assert!(!log[0].success);
        assert_eq!(monitor.alarm_state(Quantity::Temperature).last_notified_at, Some(at(5)));
    }

    #[test]
    fn test_delivery_outcome_lands_in_log() {
        let mut monitor = Monitor::new(alerting_settings(), at(0));
        let kind = EnvelopeKind::Alert { quantity: Quantity::Humidity, from: AlarmLevel::Ok, to: AlarmLevel::Warning };
        let outcome = DeliveryOutcome { success: false, attempts: 2, last_error: Some(TransportError::Timeout) };
        monitor.record_delivery(kind, outcome, at(42));
        let log = monitor.notifications();
        assert_eq!(log[0], NotificationRecord::new(kind, at(42), false, 2));
        monitor.clear_notifications();
        assert!(monitor.notifications().is_empty());
    }

    #[test]
    fn test_actions() {
        let mut monitor = Monitor::new(alerting_settings(), at(0));
        let mut outbox = TestOutbox::new();
        monitor.tick(Sample::new(at(5), 25.0, 50.0), &mut outbox);
        assert!(monitor.snapshot(at(5)).extrema[0].is_some());

        assert_eq!(monitor.run_action(ConfigAction::ResetStats, at(6), &mut outbox), Ok(FollowUp::Nothing));
        assert!(monitor.snapshot(at(6)).extrema[0].is_none());
        assert_eq!(monitor.counters().total_reads, 1);

        assert_eq!(monitor.run_action(ConfigAction::TestEmail, at(7), &mut outbox), Ok(FollowUp::Nothing));
        assert_eq!(outbox.last().map(|e| e.kind), Some(EnvelopeKind::Test));
        assert_eq!(monitor.alarm_state(Quantity::Temperature).last_notified_at, None);

        assert_eq!(
            monitor.run_action(ConfigAction::Save, at(8), &mut outbox),
            Ok(FollowUp::Persist(alerting_settings()))
        );
        assert_eq!(monitor.run_action(ConfigAction::Restart, at(9), &mut outbox), Ok(FollowUp::Restart));
    }

    #[test]
    fn test_test_email_needs_recipient() {
        let mut monitor = Monitor::new(Settings::default(), at(0));
        let mut outbox = TestOutbox::new();
        assert_eq!(monitor.queue_test_message(at(1), &mut outbox), Err(TransportError::Rejected));
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_out_of_order_tick_is_restamped() {
        let mut monitor = Monitor::new(Settings::default(), at(0));
        let mut outbox = TestOutbox::new();
        monitor.tick(Sample::new(at(50), 22.0, 50.0), &mut outbox);
        let report = monitor.tick(Sample::new(at(40), 22.0, 50.0), &mut outbox);
        assert_eq!(report.sample.timestamp, at(50));
        let history = monitor.history();
        assert!(history.samples.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_system_view() {
        let mut monitor = Monitor::new(Settings::default(), at(10));
        let mut outbox = TestOutbox::new();
        monitor.tick(Sample::failed(at(15)), &mut outbox);
        let health = DeviceHealth { free_memory_bytes: 4096, cpu_frequency_hz: 48_000_000, uptime_seconds: 15 };
        let view = monitor.system_view(health, at(70));
        assert_eq!(view.health, health);
        assert_eq!(view.uptime, at(60));
        assert_eq!(view.history_len, 1);
        assert_eq!(view.history_capacity, HISTORY_CAPACITY);
        assert_eq!(view.counters.error_count, 1);
        assert_eq!(view.sample_interval_seconds, 5);
        assert_eq!(monitor.recent_errors().len(), 1);
    }
}
