//! Per-quantity alarm state machine with hysteresis on entry and exit.
//!
//! With `e` the excursion past the nearest bound (negative inside the range)
//! and `m` the margin:
//!
//! * OK -> DANGER when `e >= m`.
//! * OK -> WARNING when `0 < e` and `e >= m * (1 - warning_fraction)`.
//! * WARNING -> DANGER when `e >= m`.
//! * WARNING or DANGER -> OK when `e <= -m`.
//!
//! DANGER latches until the reading clears; there is no step back down to
//! WARNING. Invalid metrics leave every state untouched.

use arrayvec::ArrayVec;

use crate::config::{AlarmConfig, QUANTITY_COUNT, Quantity, Threshold};
use crate::fmt::{debug, info};
use crate::metrics::Metrics;
use crate::timestamp::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AlarmLevel {
    #[default]
    Ok,
    Warning,
    Danger,
}

impl AlarmLevel {
    pub fn label(&self) -> &'static str {
        match self {
            AlarmLevel::Ok => "OK",
            AlarmLevel::Warning => "WARNING",
            AlarmLevel::Danger => "DANGER",
        }
    }

    pub fn is_alarm(&self) -> bool {
        !matches!(self, AlarmLevel::Ok)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AlarmState {
    pub level: AlarmLevel,
    pub since: Timestamp,
    pub last_notified_at: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Transition {
    pub quantity: Quantity,
    pub from: AlarmLevel,
    pub to: AlarmLevel,
    pub value: f32,
    pub bound: f32, // The threshold bound the value was compared against.
    pub at: Timestamp,
}

impl Transition {
    /// Whether this transition raises an alarm, as opposed to clearing or
    /// lowering one.
    pub fn is_escalation(&self) -> bool {
        self.to.is_alarm() && self.to != self.from
    }
}

pub type Transitions = ArrayVec<Transition, QUANTITY_COUNT>;

#[derive(Debug, Clone)]
pub struct AlarmEngine {
    states: [AlarmState; QUANTITY_COUNT],
}

impl AlarmEngine {
    pub fn new(started_at: Timestamp) -> Self {
        let state = AlarmState { level: AlarmLevel::Ok, since: started_at, last_notified_at: None };
        Self { states: [state; QUANTITY_COUNT] }
    }

    pub fn state(&self, quantity: Quantity) -> &AlarmState {
        &self.states[quantity.index()]
    }

    pub fn states(&self) -> &[AlarmState; QUANTITY_COUNT] {
        &self.states
    }

    /// Only the notification gate writes through this, and only the
    /// `last_notified_at` field.
    pub(crate) fn state_mut(&mut self, quantity: Quantity) -> &mut AlarmState {
        &mut self.states[quantity.index()]
    }

    /// Evaluate the latest metrics, returning transitions in quantity order.
    pub fn evaluate(&mut self, metrics: &Metrics, config: &AlarmConfig) -> Transitions {
        let mut transitions = Transitions::new();
        let reading = match metrics {
            Metrics::Valid(reading) => reading,
            Metrics::Invalid(reason) => {
                debug!("holding alarm states, metrics invalid: {}", reason);
                return transitions;
            }
        };

        for quantity in Quantity::ALL {
            let threshold = config.threshold(quantity);
            let value = reading.value(quantity);
            let state = &mut self.states[quantity.index()];
            let next = next_level(state.level, threshold, config.warning_fraction, value);
            if next == state.level {
                continue;
            }
            let transition = Transition {
                quantity,
                from: state.level,
                to: next,
                value,
                bound: threshold.nearest_bound(value),
                at: reading.computed_at,
            };
            info!(
                "{} {} -> {} at {} (bound {})",
                quantity.label(),
                transition.from.label(),
                transition.to.label(),
                value,
                transition.bound
            );
            state.level = next;
            state.since = reading.computed_at;
            transitions.push(transition);
        }
        transitions
    }
}

fn next_level(current: AlarmLevel, threshold: &Threshold, warning_fraction: f32, value: f32) -> AlarmLevel {
    let excursion = threshold.excursion(value);
    let margin = threshold.margin;
    match current {
        AlarmLevel::Ok => {
            if excursion >= margin {
                AlarmLevel::Danger
            } else if excursion > 0.0 && excursion >= margin * (1.0 - warning_fraction) {
                AlarmLevel::Warning
            } else {
                AlarmLevel::Ok
            }
        }
        AlarmLevel::Warning => {
            if excursion >= margin {
                AlarmLevel::Danger
            } else if excursion <= -margin {
                AlarmLevel::Ok
            } else {
                AlarmLevel::Warning
            }
        }
        AlarmLevel::Danger => {
            if excursion <= -margin {
                AlarmLevel::Ok
            } else {
                AlarmLevel::Danger
            }
        }
    }
}
