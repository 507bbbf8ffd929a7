//! Deciding when an alarm transition is worth an email, what it says, and
//! how delivery is attempted.

use arrayvec::{ArrayString, ArrayVec};
use core::fmt::Write;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::{Sender, TrySendError};

use crate::alarm::{AlarmLevel, AlarmState, Transition};
use crate::config::{NotifyConfig, Quantity, SmtpAccount, Text};
use crate::fmt::{debug, warn};
use crate::metrics::fahrenheit;
use crate::ring::Ring;
use crate::timestamp::Timestamp;

pub const NOTIFICATION_LOG_CAPACITY: usize = 10;
/// First try plus one retry.
pub const MAX_SEND_ATTEMPTS: u8 = 2;

pub const SUBJECT_LEN: usize = 64;
pub const BODY_LEN: usize = 320;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecisionReason {
    /// Entered WARNING or DANGER and nothing holds the send back.
    Alarm,
    /// Clearing or de-escalating; never notified.
    Recovery,
    Disabled,
    NoRecipient,
    CoolingDown { remaining_seconds: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NotificationDecision {
    pub send: bool,
    pub reason: DecisionReason,
}

impl NotificationDecision {
    fn hold(reason: DecisionReason) -> Self {
        Self { send: false, reason }
    }
}

/// Cooldown and policy checks for one configuration.
pub struct NotificationGate<'a> {
    config: &'a NotifyConfig,
}

impl<'a> NotificationGate<'a> {
    pub fn new(config: &'a NotifyConfig) -> Self {
        Self { config }
    }

    /// Decide whether `transition` should produce a send. A positive decision
    /// stamps `state.last_notified_at` before any delivery is attempted, so a
    /// slow or failing transport cannot trigger repeat sends.
    pub fn consider(&self, transition: &Transition, state: &mut AlarmState, now: Timestamp) -> NotificationDecision {
        if !transition.is_escalation() {
            return NotificationDecision::hold(DecisionReason::Recovery);
        }
        if !self.config.enabled {
            return NotificationDecision::hold(DecisionReason::Disabled);
        }
        if !self.config.is_active() {
            return NotificationDecision::hold(DecisionReason::NoRecipient);
        }
        if let Some(last) = state.last_notified_at {
            let cooldown = self.config.cooldown_seconds;
            // A clock that went backwards counts as "just notified".
            let elapsed = now.seconds_since(last).unwrap_or(0);
            if elapsed < cooldown {
                let remaining_seconds = cooldown - elapsed;
                debug!("{} alert held, {} s of cooldown left", transition.quantity.label(), remaining_seconds);
                return NotificationDecision::hold(DecisionReason::CoolingDown { remaining_seconds });
            }
        }
        state.last_notified_at = Some(now);
        NotificationDecision { send: true, reason: DecisionReason::Alarm }
    }
}

/// Rendered mail content, bounded in size.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertMessage {
    pub subject: ArrayString<SUBJECT_LEN>,
    pub body: ArrayString<BODY_LEN>,
}

impl AlertMessage {
    /// Anything past the buffer capacity is dropped.
    pub fn for_transition(transition: &Transition, uptime: Timestamp) -> Self {
        let quantity = transition.quantity;
        let unit = quantity.unit();
        let mut subject = ArrayString::new();
        let _ = write!(subject, "Greenhouse alert: {} {}", quantity.label(), transition.to.label());

        let mut body = ArrayString::new();
        let _ = writeln!(
            body,
            "{} is {} (was {}).",
            quantity.label(),
            transition.to.label(),
            transition.from.label()
        );
        if quantity == Quantity::Temperature {
            let _ = writeln!(
                body,
                "Value: {:.1} {} ({:.1} °F)",
                transition.value,
                unit,
                fahrenheit(transition.value)
            );
        } else {
            let _ = writeln!(body, "Value: {:.2} {}", transition.value, unit);
        }
        let _ = writeln!(body, "Threshold: {:.2} {}", transition.bound, unit);
        let _ = writeln!(body, "At: {}", transition.at.create_iso8601_str());
        let _ = writeln!(body, "Uptime: {}", uptime.create_iso8601_str());
        Self { subject, body }
    }

    pub fn test(uptime: Timestamp) -> Self {
        let mut subject = ArrayString::new();
        subject.push_str("Greenhouse monitor test email");
        let mut body = ArrayString::new();
        let _ = writeln!(body, "Email alerts are configured correctly.");
        let _ = writeln!(body, "Uptime: {}", uptime.create_iso8601_str());
        Self { subject, body }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EnvelopeKind {
    Alert { quantity: Quantity, from: AlarmLevel, to: AlarmLevel },
    Test,
}

/// Everything the mail transport needs for one message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub recipient: Text,
    pub account: SmtpAccount,
    pub message: AlertMessage,
    pub issued_at: Timestamp,
}

impl Envelope {
    pub fn alert(transition: &Transition, config: &NotifyConfig, uptime: Timestamp) -> Self {
        Self {
            kind: EnvelopeKind::Alert {
                quantity: transition.quantity,
                from: transition.from,
                to: transition.to,
            },
            recipient: config.recipient,
            account: config.account,
            message: AlertMessage::for_transition(transition, uptime),
            issued_at: transition.at,
        }
    }

    pub fn test(config: &NotifyConfig, now: Timestamp, uptime: Timestamp) -> Self {
        Self {
            kind: EnvelopeKind::Test,
            recipient: config.recipient,
            account: config.account,
            message: AlertMessage::test(uptime),
            issued_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NotificationRecord {
    pub quantity: Option<Quantity>, // None for test messages.
    pub from: AlarmLevel,
    pub to: AlarmLevel,
    pub sent_at: Timestamp,
    pub success: bool,
    pub attempts: u8,
}

impl NotificationRecord {
    pub fn new(kind: EnvelopeKind, sent_at: Timestamp, success: bool, attempts: u8) -> Self {
        let (quantity, from, to) = match kind {
            EnvelopeKind::Alert { quantity, from, to } => (Some(quantity), from, to),
            EnvelopeKind::Test => (None, AlarmLevel::Ok, AlarmLevel::Ok),
        };
        Self { quantity, from, to, sent_at, success, attempts }
    }
}

pub type NotificationLog = Ring<NotificationRecord, NOTIFICATION_LOG_CAPACITY>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    Timeout,
    Rejected,
    Link,
    /// The outbound queue was full; the message was never handed over.
    QueueFull,
    /// Settings could not be written to, or read from, storage.
    Storage,
}

/// Mail transport. Each call is a single bounded attempt.
#[allow(async_fn_in_trait)]
pub trait Mailer {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeliveryOutcome {
    pub success: bool,
    pub attempts: u8,
    pub last_error: Option<TransportError>,
}

/// Try to deliver `envelope`, retrying once on failure.
pub async fn deliver<M: Mailer>(mailer: &mut M, envelope: &Envelope) -> DeliveryOutcome {
    let mut last_error = None;
    for attempt in 1..=MAX_SEND_ATTEMPTS {
        match mailer.send(envelope).await {
            Ok(()) => return DeliveryOutcome { success: true, attempts: attempt, last_error },
            Err(err) => {
                warn!("mail attempt {}/{} failed: {}", attempt, MAX_SEND_ATTEMPTS, err);
                last_error = Some(err);
            }
        }
    }
    DeliveryOutcome { success: false, attempts: MAX_SEND_ATTEMPTS, last_error }
}

/// Non-blocking hand-off of envelopes from the tick to the mail task.
pub trait Outbox {
    fn post(&mut self, envelope: Envelope) -> Result<(), TransportError>;
}

impl<M: RawMutex, const N: usize> Outbox for Sender<'_, M, Envelope, N> {
    fn post(&mut self, envelope: Envelope) -> Result<(), TransportError> {
        self.try_send(envelope).map_err(|_: TrySendError<Envelope>| TransportError::QueueFull)
    }
}

impl<const N: usize> Outbox for ArrayVec<Envelope, N> {
    fn post(&mut self, envelope: Envelope) -> Result<(), TransportError> {
        self.try_push(envelope).map_err(|_| TransportError::QueueFull)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use embassy_sync::channel::Channel;

    fn notify_config() -> NotifyConfig {
        let mut config = NotifyConfig::default();
        config.enabled = true;
        config.cooldown_seconds = 300;
        config.recipient = Text::from("grower@example.com").unwrap();
        config.account.username = Text::from("monitor@example.com").unwrap();
        config
    }

    fn into_danger(seconds: u32) -> Transition {
        Transition {
            quantity: Quantity::Temperature,
            from: AlarmLevel::Ok,
            to: AlarmLevel::Danger,
            value: 29.0,
            bound: 28.0,
            at: Timestamp { seconds },
        }
    }

    fn recovery(seconds: u32) -> Transition {
        Transition { from: AlarmLevel::Danger, to: AlarmLevel::Ok, value: 27.0, ..into_danger(seconds) }
    }

    #[test]
    fn test_cooldown_allows_one_send() {
        let config = notify_config();
        let gate = NotificationGate::new(&config);
        let mut state = AlarmState::default();

        let first = gate.consider(&into_danger(10), &mut state, Timestamp { seconds: 10 });
        assert_eq!(first, NotificationDecision { send: true, reason: DecisionReason::Alarm });
        assert_eq!(state.last_notified_at, Some(Timestamp { seconds: 10 }));

        let recovered = gate.consider(&recovery(20), &mut state, Timestamp { seconds: 20 });
        assert_eq!(recovered.reason, DecisionReason::Recovery);

        let second = gate.consider(&into_danger(60), &mut state, Timestamp { seconds: 60 });
        assert_eq!(second, NotificationDecision::hold(DecisionReason::CoolingDown { remaining_seconds: 250 }));
        assert_eq!(state.last_notified_at, Some(Timestamp { seconds: 10 }));

        let third = gate.consider(&into_danger(310), &mut state, Timestamp { seconds: 310 });
        assert!(third.send);
        assert_eq!(state.last_notified_at, Some(Timestamp { seconds: 310 }));
    }

    #[test]
    fn test_policy_holds() {
        let mut config = notify_config();
        let mut state = AlarmState::default();

        config.enabled = false;
        let decision = NotificationGate::new(&config).consider(&into_danger(1), &mut state, Timestamp { seconds: 1 });
        assert_eq!(decision.reason, DecisionReason::Disabled);

        config.enabled = true;
        config.recipient.clear();
        let decision = NotificationGate::new(&config).consider(&into_danger(1), &mut state, Timestamp { seconds: 1 });
        assert_eq!(decision.reason, DecisionReason::NoRecipient);
        assert_eq!(state.last_notified_at, None);
    }

    #[test]
    fn test_backwards_clock_counts_as_cooling_down() {
        let config = notify_config();
        let gate = NotificationGate::new(&config);
        let mut state = AlarmState { last_notified_at: Some(Timestamp { seconds: 500 }), ..AlarmState::default() };
        let decision = gate.consider(&into_danger(100), &mut state, Timestamp { seconds: 100 });
        assert_eq!(decision.reason, DecisionReason::CoolingDown { remaining_seconds: 300 });
    }

    #[test]
    fn test_alert_message_contents() {
        let message = AlertMessage::for_transition(&into_danger(300), Timestamp { seconds: 3600 });
        assert_eq!(message.subject.as_str(), "Greenhouse alert: Temperature DANGER");
        assert!(message.body.contains("Temperature is DANGER (was OK)."));
        assert!(message.body.contains("Value: 29.0 °C (84.2 °F)"));
        assert!(message.body.contains("Threshold: 28.00 °C"));
        assert!(message.body.contains("Uptime: P0DT1H0M0S"));
    }

    struct FlakyMailer {
        failures_left: u8,
        calls: u8,
    }

    impl Mailer for FlakyMailer {
        async fn send(&mut self, _envelope: &Envelope) -> Result<(), TransportError> {
            self.calls += 1;
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(TransportError::Timeout);
            }
            Ok(())
        }
    }

    #[test]
    fn test_delivery_retries_once() {
        let config = notify_config();
        let envelope = Envelope::test(&config, Timestamp { seconds: 5 }, Timestamp { seconds: 5 });

        let mut mailer = FlakyMailer { failures_left: 1, calls: 0 };
        let outcome = block_on(deliver(&mut mailer, &envelope));
        assert_eq!(outcome, DeliveryOutcome { success: true, attempts: 2, last_error: Some(TransportError::Timeout) });

        let mut mailer = FlakyMailer { failures_left: 5, calls: 0 };
        let outcome = block_on(deliver(&mut mailer, &envelope));
        assert!(!outcome.success);
        assert_eq!(mailer.calls, MAX_SEND_ATTEMPTS);
    }

    #[test]
    fn test_channel_outbox_reports_full_queue() {
        let config = notify_config();
        let channel: Channel<NoopRawMutex, Envelope, 1> = Channel::new();
        let mut outbox = channel.sender();
        let envelope = Envelope::alert(&into_danger(1), &config, Timestamp { seconds: 1 });
        assert_eq!(outbox.post(envelope.clone()), Ok(()));
        assert_eq!(outbox.post(envelope), Err(TransportError::QueueFull));
        assert_eq!(channel.len(), 1);
    }

    #[test]
    fn test_record_from_test_envelope() {
        let record = NotificationRecord::new(EnvelopeKind::Test, Timestamp { seconds: 9 }, false, 2);
        assert_eq!(record.quantity, None);
        assert!(!record.success);
    }
}
