//! Alarm thresholds, notification settings, and their text encodings.
//!
//! `Settings` is always replaced as a whole: writers build a new value,
//! validate it, and swap it in, so the sampling loop never sees a half
//! applied update.

use arrayvec::{ArrayString, ArrayVec};
use core::fmt::Write;

use crate::metrics::PlausibleBand;
use crate::timestamp::Timestamp;

pub const TEXT_LEN: usize = 64;
pub const SETTINGS_RECORD_LEN: usize = 768;
const FORM_FIELD_LEN: usize = 96;

pub const DEFAULT_SAMPLE_INTERVAL_SECONDS: u32 = 5;
pub const MAX_SAMPLE_INTERVAL_SECONDS: u32 = 3600;
pub const DEFAULT_COOLDOWN_SECONDS: u32 = 5 * 60;
pub const DEFAULT_WARNING_FRACTION: f32 = 0.5;

pub type Text = ArrayString<TEXT_LEN>;

/// A monitored quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Quantity {
    Temperature,
    Humidity,
    Vpd,
}

pub const QUANTITY_COUNT: usize = 3;

impl Quantity {
    pub const ALL: [Quantity; QUANTITY_COUNT] = [Quantity::Temperature, Quantity::Humidity, Quantity::Vpd];

    pub fn index(&self) -> usize {
        match self {
            Quantity::Temperature => 0,
            Quantity::Humidity => 1,
            Quantity::Vpd => 2,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Quantity::Temperature => "Temperature",
            Quantity::Humidity => "Humidity",
            Quantity::Vpd => "VPD",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Quantity::Temperature => "°C",
            Quantity::Humidity => "%",
            Quantity::Vpd => "kPa",
        }
    }

    /// Prefix used for this quantity's fields in settings records and forms.
    pub fn key(&self) -> &'static str {
        match self {
            Quantity::Temperature => "temp",
            Quantity::Humidity => "humidity",
            Quantity::Vpd => "vpd",
        }
    }
}

/// Acceptable range of one quantity plus the hysteresis margin applied
/// around both bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Threshold {
    pub min: f32,
    pub max: f32,
    pub margin: f32,
}

impl Threshold {
    pub const fn new(min: f32, max: f32, margin: f32) -> Self {
        Self { min, max, margin }
    }

    /// How far `value` lies outside the range. Negative inside the range.
    pub fn excursion(&self, value: f32) -> f32 {
        (value - self.max).max(self.min - value)
    }

    /// The bound `value` is closest to violating.
    pub fn nearest_bound(&self, value: f32) -> f32 {
        if value - self.max >= self.min - value {
            self.max
        } else {
            self.min
        }
    }

    fn validate(&self, quantity: Quantity) -> Result<(), ConfigError> {
        if !self.min.is_finite() || !self.max.is_finite() || self.min >= self.max {
            return Err(ConfigError::Range(quantity));
        }
        // The two clear points (min + margin, max - margin) must not cross.
        if !self.margin.is_finite() || self.margin <= 0.0 || 2.0 * self.margin >= self.max - self.min {
            return Err(ConfigError::Margin(quantity));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AlarmConfig {
    pub temperature: Threshold,
    pub humidity: Threshold,
    pub vpd: Threshold,
    /// Share of the margin, measured back from the DANGER point, that is
    /// reported as WARNING. 0 disables WARNING, 1 warns on any excursion.
    pub warning_fraction: f32,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            temperature: Threshold::new(20.0, 26.0, 1.0),
            humidity: Threshold::new(40.0, 60.0, 2.0),
            vpd: Threshold::new(0.5, 1.2, 0.1),
            warning_fraction: DEFAULT_WARNING_FRACTION,
        }
    }
}

impl AlarmConfig {
    pub fn threshold(&self, quantity: Quantity) -> &Threshold {
        match quantity {
            Quantity::Temperature => &self.temperature,
            Quantity::Humidity => &self.humidity,
            Quantity::Vpd => &self.vpd,
        }
    }

    pub fn threshold_mut(&mut self, quantity: Quantity) -> &mut Threshold {
        match quantity {
            Quantity::Temperature => &mut self.temperature,
            Quantity::Humidity => &mut self.humidity,
            Quantity::Vpd => &mut self.vpd,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmtpAccount {
    pub host: Text,
    pub port: u16,
    pub username: Text,
    pub password: Text,
}

impl Default for SmtpAccount {
    fn default() -> Self {
        let mut host = Text::new();
        host.push_str("smtp.gmail.com");
        Self { host, port: 587, username: Text::new(), password: Text::new() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NotifyConfig {
    pub enabled: bool,
    pub cooldown_seconds: u32,
    pub recipient: Text,
    pub account: SmtpAccount,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cooldown_seconds: DEFAULT_COOLDOWN_SECONDS,
            recipient: Text::new(),
            account: SmtpAccount::default(),
        }
    }
}

impl NotifyConfig {
    /// Whether alerts can actually be addressed and sent.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.recipient.is_empty() && !self.account.username.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settings {
    pub alarm: AlarmConfig,
    pub notify: NotifyConfig,
    pub sample_interval_seconds: u32,
    pub plausible: PlausibleBand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// min/max not finite or not ordered.
    Range(Quantity),
    /// Margin not positive, or too wide for the range.
    Margin(Quantity),
    WarningFraction,
    Interval,
    PlausibleBand,
    /// Notifications enabled without a recipient or account.
    MissingRecipient,
    BadValue,
    FieldTooLong,
    /// The encoded record does not fit its buffer.
    RecordFull,
}

impl ConfigError {
    pub fn message(&self) -> &'static str {
        match self {
            ConfigError::Range(_) => "min must be below max",
            ConfigError::Margin(_) => "margin must be positive and under half the range",
            ConfigError::WarningFraction => "warning fraction must be within 0..1",
            ConfigError::Interval => "sample interval must be 1..3600 s",
            ConfigError::PlausibleBand => "plausible band must be ordered",
            ConfigError::MissingRecipient => "alerts need a recipient and username",
            ConfigError::BadValue => "malformed value",
            ConfigError::FieldTooLong => "field too long",
            ConfigError::RecordFull => "settings record full",
        }
    }
}

/// Operator commands carried alongside a settings form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigAction {
    ClearLog,
    ResetStats,
    TestEmail,
    Save,
    Restart,
}

impl ConfigAction {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "clear_logs" => Some(ConfigAction::ClearLog),
            "reset_stats" => Some(ConfigAction::ResetStats),
            "test_email" => Some(ConfigAction::TestEmail),
            "save" => Some(ConfigAction::Save),
            "restart" => Some(ConfigAction::Restart),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FormUpdate {
    pub settings: Settings,
    pub action: Option<ConfigAction>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            alarm: AlarmConfig::default(),
            notify: NotifyConfig::default(),
            sample_interval_seconds: DEFAULT_SAMPLE_INTERVAL_SECONDS,
            plausible: PlausibleBand::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for quantity in Quantity::ALL {
            self.alarm.threshold(quantity).validate(quantity)?;
        }
        if !(0.0..=1.0).contains(&self.alarm.warning_fraction) {
            return Err(ConfigError::WarningFraction);
        }
        if self.sample_interval_seconds == 0 || self.sample_interval_seconds > MAX_SAMPLE_INTERVAL_SECONDS {
            return Err(ConfigError::Interval);
        }
        let band = &self.plausible;
        if !band.min_temperature.is_finite()
            || !band.max_temperature.is_finite()
            || band.min_temperature >= band.max_temperature
        {
            return Err(ConfigError::PlausibleBand);
        }
        let notify = &self.notify;
        if notify.enabled && (notify.recipient.is_empty() || notify.account.username.is_empty()) {
            return Err(ConfigError::MissingRecipient);
        }
        Ok(())
    }

    /// Serialize to `key=value` lines. Secrets are left out unless asked for,
    /// so the same encoding can be shown to dashboard clients.
    pub fn encode(&self, include_secrets: bool) -> Result<ArrayString<SETTINGS_RECORD_LEN>, ConfigError> {
        let mut out = ArrayString::<SETTINGS_RECORD_LEN>::new();
        self.write_record(&mut out, include_secrets)
            .map_err(|_| ConfigError::RecordFull)?;
        Ok(out)
    }

    fn write_record(&self, out: &mut impl Write, include_secrets: bool) -> core::fmt::Result {
        for quantity in Quantity::ALL {
            let threshold = self.alarm.threshold(quantity);
            let key = quantity.key();
            writeln!(out, "{}_min={}", key, threshold.min)?;
            writeln!(out, "{}_max={}", key, threshold.max)?;
            writeln!(out, "{}_margin={}", key, threshold.margin)?;
        }
        writeln!(out, "warning_fraction={}", self.alarm.warning_fraction)?;
        writeln!(out, "sample_interval={}", self.sample_interval_seconds)?;
        writeln!(out, "plausible_min={}", self.plausible.min_temperature)?;
        writeln!(out, "plausible_max={}", self.plausible.max_temperature)?;

        let notify = &self.notify;
        writeln!(out, "email_enabled={}", if notify.enabled { "on" } else { "off" })?;
        let cooldown = Timestamp::from_seconds(notify.cooldown_seconds).create_iso8601_str();
        writeln!(out, "cooldown={}", cooldown)?;
        writeln!(out, "email_to={}", notify.recipient)?;
        writeln!(out, "smtp_host={}", notify.account.host)?;
        writeln!(out, "smtp_port={}", notify.account.port)?;
        writeln!(out, "email_username={}", notify.account.username)?;
        if include_secrets {
            writeln!(out, "email_password={}", notify.account.password)?;
        }
        Ok(())
    }

    /// Parse a record produced by `encode`. Missing keys keep their defaults
    /// and unknown keys are ignored, so older records still load.
    pub fn decode(record: &str) -> Result<Settings, ConfigError> {
        let mut settings = Settings::default();
        for line in record.lines() {
            if line.trim().is_empty() || line.trim_start().starts_with('#') {
                continue;
            }
            // Values are taken verbatim; text fields may carry edge spaces.
            let (key, value) = line.split_once('=').ok_or(ConfigError::BadValue)?;
            settings.apply_field(key.trim(), value)?;
        }
        settings.validate()?;
        Ok(settings)
    }

    /// Build the settings that result from a dashboard form submission
    /// (`application/x-www-form-urlencoded`). `self` is left untouched; the
    /// caller swaps in the returned value.
    pub fn updated_from_form(&self, body: &str) -> Result<FormUpdate, ConfigError> {
        let mut settings = *self;
        let mut action = None;
        for pair in body.trim().split('&').filter(|p| !p.is_empty()) {
            let (raw_key, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = form_decode(raw_key)?;
            let value = form_decode(raw_value)?;
            if key.as_str() == "action" {
                action = ConfigAction::parse(value.as_str());
            } else {
                settings.apply_field(key.as_str(), value.as_str())?;
            }
        }
        settings.validate()?;
        Ok(FormUpdate { settings, action })
    }

    fn apply_field(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        // Blank form fields mean "leave unchanged".
        if value.is_empty() {
            return Ok(());
        }
        if let Some((prefix, field)) = key.rsplit_once('_') {
            if let Some(quantity) = Quantity::ALL.into_iter().find(|q| q.key() == prefix) {
                let threshold = self.alarm.threshold_mut(quantity);
                match field {
                    "min" => threshold.min = parse_f32(value)?,
                    "max" => threshold.max = parse_f32(value)?,
                    "margin" => threshold.margin = parse_f32(value)?,
                    _ => {}
                }
                return Ok(());
            }
        }
        match key {
            "warning_fraction" => self.alarm.warning_fraction = parse_f32(value)?,
            "sample_interval" => self.sample_interval_seconds = parse_u32(value)?,
            "plausible_min" => self.plausible.min_temperature = parse_f32(value)?,
            "plausible_max" => self.plausible.max_temperature = parse_f32(value)?,
            "email_enabled" => self.notify.enabled = parse_switch(value)?,
            "email_cooldown" => {
                let minutes = parse_u32(value)?;
                self.notify.cooldown_seconds = minutes.checked_mul(60).ok_or(ConfigError::BadValue)?;
            }
            "cooldown" => {
                self.notify.cooldown_seconds = Timestamp::duration_from_iso8601(value)
                    .ok_or(ConfigError::BadValue)?
                    .seconds;
            }
            "email_to" => self.notify.recipient = parse_text(value)?,
            "smtp_host" => self.notify.account.host = parse_text(value)?,
            "smtp_port" => self.notify.account.port = value.trim().parse().map_err(|_| ConfigError::BadValue)?,
            "email_username" => self.notify.account.username = parse_text(value)?,
            "email_password" => self.notify.account.password = parse_text(value)?,
            _ => {}
        }
        Ok(())
    }
}

fn parse_f32(value: &str) -> Result<f32, ConfigError> {
    value.trim().parse::<f32>().map_err(|_| ConfigError::BadValue)
}

fn parse_u32(value: &str) -> Result<u32, ConfigError> {
    value.trim().parse::<u32>().map_err(|_| ConfigError::BadValue)
}

fn parse_switch(value: &str) -> Result<bool, ConfigError> {
    match value.trim() {
        "on" | "1" | "true" => Ok(true),
        "off" | "0" | "false" => Ok(false),
        _ => Err(ConfigError::BadValue),
    }
}

/// Text fields end up in line-based records and mail frames, so control
/// characters are refused.
fn parse_text(value: &str) -> Result<Text, ConfigError> {
    if value.chars().any(char::is_control) {
        return Err(ConfigError::BadValue);
    }
    Text::from(value).map_err(|_| ConfigError::FieldTooLong)
}

/// Undo form encoding: `+` is a space and `%XX` an escaped byte.
fn form_decode(raw: &str) -> Result<ArrayString<FORM_FIELD_LEN>, ConfigError> {
    let bytes = raw.as_bytes();
    let mut decoded = ArrayVec::<u8, FORM_FIELD_LEN>::new();
    let mut i = 0;
    while i < bytes.len() {
        let byte = match bytes[i] {
            b'+' => {
                i += 1;
                b' '
            }
            b'%' => {
                let hex = raw.get(i + 1..i + 3).ok_or(ConfigError::BadValue)?;
                i += 3;
                u8::from_str_radix(hex, 16).map_err(|_| ConfigError::BadValue)?
            }
            other => {
                i += 1;
                other
            }
        };
        decoded.try_push(byte).map_err(|_| ConfigError::FieldTooLong)?;
    }
    let text = core::str::from_utf8(&decoded).map_err(|_| ConfigError::BadValue)?;
    ArrayString::from(text).map_err(|_| ConfigError::FieldTooLong)
}
