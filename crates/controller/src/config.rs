//! TOML config file loading and validation: output pins, reader timings,
//! activation durations, lockout thresholds and loop pacing.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::db::Db;
use crate::store::TokenRecord;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Card that toggles master mode and clears lockouts.
    pub master_token_id: Option<String>,
    pub outputs: OutputConfig,
    pub reader: ReaderConfig,
    pub activation: ActivationConfig,
    pub security: SecurityConfig,
    pub runtime: RuntimeConfig,
    /// Cards seeded into the token table at startup.
    pub tokens: Vec<TokenEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub relays: Vec<RelayEntry>,
    pub red_led: i64,
    pub green_led: i64,
    /// Relay boards here are active-high; flip for active-low modules.
    pub active_low: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayEntry {
    pub name: String,
    pub pin: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenEntry {
    pub token_id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub barred: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub reset_pin: Option<i64>,
    pub spi_clock_hz: u32,
    pub periodic_reset_min: i64,
    pub watchdog_min: i64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ActivationConfig {
    pub base_sec: i64,
    pub extended_sec: i64,
    pub idle_threshold_min: i64,
    pub idle_reference: IdleReference,
}

/// What "idle" is measured from when choosing the extended duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleReference {
    /// Last authorised activation seen by this process.
    LastActivation,
    /// Newest row in the usage log.
    LastUsage,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub max_invalid_attempts: i64,
    pub window_sec: i64,
    pub lockout_sec: i64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub poll_interval_ms: i64,
    pub restart: RestartMode,
}

/// How an unrecoverable reader failure restarts the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartMode {
    /// Exit with [`crate::EXIT_RESTART`] and let the supervisor restart us.
    Exit,
    /// Replace the process image with a fresh copy of itself.
    Exec,
}

// ---------------------------------------------------------------------------
// Defaults (stock espresso machine wiring)
// ---------------------------------------------------------------------------

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            relays: vec![
                RelayEntry { name: "power".into(), pin: 17 },
                RelayEntry { name: "single".into(), pin: 27 },
                RelayEntry { name: "double".into(), pin: 22 },
                RelayEntry { name: "steam".into(), pin: 23 },
            ],
            red_led: 5,
            green_led: 6,
            active_low: false,
        }
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            reset_pin: Some(25),
            spi_clock_hz: 1_000_000,
            periodic_reset_min: 30,
            watchdog_min: 15,
        }
    }
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            base_sec: 30,
            extended_sec: 90,
            idle_threshold_min: 180,
            idle_reference: IdleReference::LastActivation,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_invalid_attempts: 10,
            window_sec: 60,
            lockout_sec: 300,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            restart: RestartMode::Exit,
        }
    }
}

impl RuntimeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(0) as u64)
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// SPI0 (CE1, CE0, MISO, MOSI, SCLK) belongs to the card reader.
const SPI0_PINS: &[i64] = &[7, 8, 9, 10, 11];

/// Upper bounds for timing settings.
const WEEK_MIN: i64 = 7 * 24 * 60;
const WEEK_SEC: i64 = WEEK_MIN * 60;
const DAY_SEC: i64 = 24 * 60 * 60;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_pins(&mut errors);
        self.validate_timings(&mut errors);
        self.validate_tokens(&mut errors);

        if let Some(master) = &self.master_token_id {
            if master.trim().is_empty() {
                errors.push("master_token_id is set but empty".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_pins(&self, errors: &mut Vec<String>) {
        let mut seen_pins: HashSet<i64> = HashSet::new();
        let mut seen_names: HashSet<&str> = HashSet::new();

        let mut check_pin = |what: String, pin: i64, errors: &mut Vec<String>| {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "{what}: pin {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if SPI0_PINS.contains(&pin) {
                errors.push(format!(
                    "{what}: pin {pin} is reserved for the card reader (SPI0)"
                ));
            } else if !seen_pins.insert(pin) {
                errors.push(format!("{what}: pin {pin} is already in use"));
            }
        };

        if self.outputs.relays.is_empty() {
            errors.push("outputs: at least one relay is required".to_string());
        }

        for (i, r) in self.outputs.relays.iter().enumerate() {
            let what = if r.name.trim().is_empty() {
                errors.push(format!("relays[{i}]: name is empty"));
                format!("relays[{i}]")
            } else {
                if !seen_names.insert(&r.name) {
                    errors.push(format!("relay '{}': duplicate name", r.name));
                }
                format!("relay '{}'", r.name)
            };
            check_pin(what, r.pin, errors);
        }

        check_pin("red_led".to_string(), self.outputs.red_led, errors);
        check_pin("green_led".to_string(), self.outputs.green_led, errors);

        if let Some(pin) = self.reader.reset_pin {
            check_pin("reader reset_pin".to_string(), pin, errors);
        }
    }

    fn validate_timings(&self, errors: &mut Vec<String>) {
        // (name, value, upper bound). The bounds keep every derived
        // `time::Duration` and deadline far from overflow.
        let bounded = [
            ("reader.periodic_reset_min", self.reader.periodic_reset_min, WEEK_MIN),
            ("reader.watchdog_min", self.reader.watchdog_min, WEEK_MIN),
            ("activation.base_sec", self.activation.base_sec, WEEK_SEC),
            ("activation.extended_sec", self.activation.extended_sec, WEEK_SEC),
            ("activation.idle_threshold_min", self.activation.idle_threshold_min, WEEK_MIN),
            ("security.max_invalid_attempts", self.security.max_invalid_attempts, 1000),
            ("security.window_sec", self.security.window_sec, DAY_SEC),
            ("security.lockout_sec", self.security.lockout_sec, WEEK_SEC),
            ("runtime.poll_interval_ms", self.runtime.poll_interval_ms, 60_000),
        ];
        for (name, value, max) in bounded {
            if value <= 0 {
                errors.push(format!("{name} must be positive, got {value}"));
            } else if value > max {
                errors.push(format!("{name} must be at most {max}, got {value}"));
            }
        }

        if self.activation.extended_sec < self.activation.base_sec {
            errors.push(format!(
                "activation.extended_sec ({}) must not be shorter than base_sec ({})",
                self.activation.extended_sec, self.activation.base_sec
            ));
        }

        if self.reader.spi_clock_hz == 0 {
            errors.push("reader.spi_clock_hz must be positive".to_string());
        }
    }
}

impl Config {
    fn validate_tokens(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<String> = HashSet::new();
        for (i, t) in self.tokens.iter().enumerate() {
            let id = t.token_id.trim().to_ascii_lowercase();
            if id.is_empty() {
                errors.push(format!("tokens[{i}]: token_id is empty"));
            } else if !id.chars().all(|c| c.is_ascii_hexdigit()) {
                errors.push(format!("token '{}': token_id must be hex", t.token_id));
            } else if !seen.insert(id) {
                errors.push(format!("token '{}': duplicate token_id", t.token_id));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert the `[[tokens]]` entries into the database.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for t in &config.tokens {
        let token_id = t.token_id.trim().to_ascii_lowercase();
        db.add_token(&TokenRecord {
            token_id: token_id.clone(),
            name: t.name.clone(),
            active: t.active,
            barred: t.barred,
        })
        .await
        .with_context(|| format!("failed to upsert token '{token_id}'"))?;
    }

    tracing::info!(tokens = config.tokens.len(), "config applied");
    Ok(())
}

/// Pick the master token: environment, then config file, then the value
/// stored in the settings table. Blank values are skipped.
pub fn resolve_master_token(
    env: Option<String>,
    config: Option<&str>,
    stored: Option<String>,
) -> Option<String> {
    env.into_iter()
        .chain(config.map(str::to_string))
        .chain(stored)
        .map(|t| t.trim().to_ascii_lowercase())
        .find(|t| !t.is_empty())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.outputs.relays.len(), 4);
        assert_eq!(config.outputs.red_led, 5);
        assert_eq!(config.outputs.green_led, 6);
        assert!(!config.outputs.active_low);
        assert_eq!(config.reader.reset_pin, Some(25));
        assert_eq!(config.activation.base_sec, 30);
        assert_eq!(config.security.max_invalid_attempts, 10);
        assert_eq!(config.runtime.restart, RestartMode::Exit);
        assert!(config.master_token_id.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
master_token_id = "deadbeef22"

[outputs]
red_led = 12
green_led = 13
active_low = true

[[outputs.relays]]
name = "power"
pin = 17

[reader]
reset_pin = 24
periodic_reset_min = 20
watchdog_min = 10

[activation]
base_sec = 30
extended_sec = 120
idle_threshold_min = 30
idle_reference = "last_usage"

[security]
max_invalid_attempts = 5
window_sec = 30
lockout_sec = 600

[runtime]
poll_interval_ms = 50
restart = "exec"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.master_token_id.as_deref(), Some("deadbeef22"));
        assert_eq!(config.outputs.relays.len(), 1);
        assert!(config.outputs.active_low);
        assert_eq!(config.reader.reset_pin, Some(24));
        assert_eq!(config.activation.idle_reference, IdleReference::LastUsage);
        assert_eq!(config.activation.extended_sec, 120);
        assert_eq!(config.security.lockout_sec, 600);
        assert_eq!(config.runtime.restart, RestartMode::Exec);
        assert_eq!(config.runtime.poll_interval(), Duration::from_millis(50));
    }

    #[test]
    fn parse_unknown_idle_reference_fails() {
        let toml_str = r#"
[activation]
idle_reference = "yesterday"
"#;
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }

    // -- Pins -------------------------------------------------------------

    #[test]
    fn relay_pin_outside_header_rejected() {
        let mut cfg = Config::default();
        cfg.outputs.relays[0].pin = 28;
        assert_validation_err(&cfg, "not a valid BCM GPIO pin");
    }

    #[test]
    fn relay_pin_zero_rejected() {
        let mut cfg = Config::default();
        cfg.outputs.relays[0].pin = 0;
        assert_validation_err(&cfg, "not a valid BCM GPIO pin");
    }

    #[test]
    fn spi_pins_reserved_for_reader() {
        let mut cfg = Config::default();
        cfg.outputs.green_led = 10;
        assert_validation_err(&cfg, "reserved for the card reader");
    }

    #[test]
    fn led_sharing_relay_pin_rejected() {
        let mut cfg = Config::default();
        cfg.outputs.red_led = 17;
        assert_validation_err(&cfg, "red_led: pin 17 is already in use");
    }

    #[test]
    fn reset_pin_sharing_relay_pin_rejected() {
        let mut cfg = Config::default();
        cfg.reader.reset_pin = Some(23);
        assert_validation_err(&cfg, "reader reset_pin: pin 23 is already in use");
    }

    #[test]
    fn no_reset_pin_is_fine() {
        let mut cfg = Config::default();
        cfg.reader.reset_pin = None;
        cfg.validate().unwrap();
    }

    #[test]
    fn no_relays_rejected() {
        let mut cfg = Config::default();
        cfg.outputs.relays.clear();
        assert_validation_err(&cfg, "at least one relay");
    }

    #[test]
    fn duplicate_relay_name_rejected() {
        let mut cfg = Config::default();
        cfg.outputs.relays[1].name = "power".into();
        assert_validation_err(&cfg, "duplicate name");
    }

    #[test]
    fn empty_relay_name_rejected() {
        let mut cfg = Config::default();
        cfg.outputs.relays[2].name = " ".into();
        assert_validation_err(&cfg, "relays[2]: name is empty");
    }

    // -- Timings ----------------------------------------------------------

    #[test]
    fn zero_base_duration_rejected() {
        let mut cfg = Config::default();
        cfg.activation.base_sec = 0;
        assert_validation_err(&cfg, "activation.base_sec must be positive");
    }

    #[test]
    fn extended_shorter_than_base_rejected() {
        let mut cfg = Config::default();
        cfg.activation.base_sec = 60;
        cfg.activation.extended_sec = 45;
        assert_validation_err(&cfg, "must not be shorter than base_sec");
    }

    #[test]
    fn negative_lockout_rejected() {
        let mut cfg = Config::default();
        cfg.security.lockout_sec = -1;
        assert_validation_err(&cfg, "security.lockout_sec must be positive");
    }

    #[test]
    fn huge_idle_threshold_rejected() {
        let mut cfg = Config::default();
        cfg.activation.idle_threshold_min = i64::MAX;
        assert_validation_err(&cfg, "activation.idle_threshold_min must be at most 10080");
    }

    #[test]
    fn huge_lockout_and_reset_interval_rejected() {
        let mut cfg = Config::default();
        cfg.security.lockout_sec = 10_000_000;
        cfg.reader.periodic_reset_min = 1 << 40;
        assert_validation_err(&cfg, "security.lockout_sec must be at most 604800");
        assert_validation_err(&cfg, "reader.periodic_reset_min must be at most 10080");
    }

    #[test]
    fn week_long_timings_accepted() {
        let mut cfg = Config::default();
        cfg.activation.idle_threshold_min = WEEK_MIN;
        cfg.activation.extended_sec = WEEK_SEC;
        cfg.security.lockout_sec = WEEK_SEC;
        cfg.reader.watchdog_min = WEEK_MIN;
        cfg.validate().unwrap();
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let mut cfg = Config::default();
        cfg.runtime.poll_interval_ms = 0;
        assert_validation_err(&cfg, "runtime.poll_interval_ms must be positive");
    }

    #[test]
    fn blank_master_token_rejected() {
        let cfg = Config {
            master_token_id: Some("  ".into()),
            ..Config::default()
        };
        assert_validation_err(&cfg, "master_token_id is set but empty");
    }

    // -- Multiple errors reported at once ---------------------------------

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = Config::default();
        cfg.outputs.red_led = 1;
        cfg.reader.watchdog_min = 0;
        cfg.security.window_sec = -5;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "wrong count in: {msg}");
        assert!(msg.contains("red_led"), "missing pin error in: {msg}");
        assert!(msg.contains("watchdog_min"), "missing watchdog error in: {msg}");
        assert!(msg.contains("window_sec"), "missing window error in: {msg}");
    }

    // -- Master token resolution ------------------------------------------

    #[test]
    fn env_master_token_wins() {
        let token = resolve_master_token(
            Some("AA11".into()),
            Some("bb22"),
            Some("cc33".into()),
        );
        assert_eq!(token.as_deref(), Some("aa11"));
    }

    #[test]
    fn config_master_token_beats_stored() {
        let token = resolve_master_token(None, Some("bb22"), Some("cc33".into()));
        assert_eq!(token.as_deref(), Some("bb22"));
    }

    #[test]
    fn stored_master_token_is_last_resort() {
        let token = resolve_master_token(Some("".into()), None, Some("cc33".into()));
        assert_eq!(token.as_deref(), Some("cc33"));
    }

    #[test]
    fn no_master_token_anywhere() {
        assert!(resolve_master_token(None, None, None).is_none());
    }

    // -- Seeded tokens ----------------------------------------------------

    #[test]
    fn parse_tokens_with_defaults() {
        let toml_str = r#"
[[tokens]]
token_id = "A1B2C3D4E5"
name = "Ada"

[[tokens]]
token_id = "0102030404"
name = "Former member"
active = false
barred = true
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.tokens.len(), 2);
        assert!(config.tokens[0].active);
        assert!(!config.tokens[0].barred);
        assert!(config.tokens[1].barred);
    }

    #[test]
    fn duplicate_token_ids_rejected_case_insensitively() {
        let toml_str = r#"
[[tokens]]
token_id = "abcdef0123"
name = "One"

[[tokens]]
token_id = "ABCDEF0123"
name = "Two"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_validation_err(&config, "duplicate token_id");
    }

    #[test]
    fn non_hex_token_id_rejected() {
        let toml_str = r#"
[[tokens]]
token_id = "card-7"
name = "Bad"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_validation_err(&config, "token_id must be hex");
    }

    #[tokio::test]
    async fn apply_seeds_lowercased_tokens() {
        use crate::store::TokenStore;

        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let toml_str = r#"
[[tokens]]
token_id = "A1B2C3D4E5"
name = "Ada"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        apply(&config, &db).await.unwrap();
        apply(&config, &db).await.unwrap();

        let t = db.get_token("a1b2c3d4e5").await.unwrap().unwrap();
        assert_eq!(t.name, "Ada");
        assert!(t.is_usable());
        assert_eq!(db.count_tokens().await.unwrap(), 1);
    }
}
