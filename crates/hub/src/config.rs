//! TOML config file loading, validation, and database seeding for power
//! sensors.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tracing::warn;

use crate::cadence::Cadence;
use crate::db::{Db, DeviceRecord};
use crate::scheduler::{
    SchedulerSettings, DEFAULT_LEASE_MAX_HOLD, DEFAULT_LEASE_MIN_HOLD, DEFAULT_POOL_SIZE,
};
use crate::sensor::{
    OFF_THRESHOLD_PARAMETER, ON_THRESHOLD_PARAMETER, PARAMETER_VERSION, POWER_SENSOR_TYPE,
    QUERY_PARAMETER, UPDATE_CRON_EXPRESSION_PARAMETER, VERSION_PARAMETER,
};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub influxdb2: InfluxDb2Section,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
}

#[derive(Debug, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_db_url")]
    pub db_url: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            db_url: default_db_url(),
        }
    }
}

fn default_db_url() -> String {
    "sqlite:power-relay.db?mode=rwc".to_string()
}

#[derive(Debug, Deserialize)]
pub struct InfluxDb2Section {
    #[serde(default = "default_influx_url")]
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub organization: String,
}

impl Default for InfluxDb2Section {
    fn default() -> Self {
        Self {
            url: default_influx_url(),
            token: String::new(),
            organization: String::new(),
        }
    }
}

fn default_influx_url() -> String {
    "http://127.0.0.1:8086".to_string()
}

#[derive(Debug, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_pool_size")]
    pub pool_size: i64,
    #[serde(default = "default_lease_min_hold_sec")]
    pub lease_min_hold_sec: i64,
    #[serde(default = "default_lease_max_hold_sec")]
    pub lease_max_hold_sec: i64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            lease_min_hold_sec: default_lease_min_hold_sec(),
            lease_max_hold_sec: default_lease_max_hold_sec(),
        }
    }
}

fn default_pool_size() -> i64 {
    DEFAULT_POOL_SIZE as i64
}

fn default_lease_min_hold_sec() -> i64 {
    DEFAULT_LEASE_MIN_HOLD.as_secs() as i64
}

fn default_lease_max_hold_sec() -> i64 {
    DEFAULT_LEASE_MAX_HOLD.as_secs() as i64
}

impl SchedulerSection {
    /// Only meaningful after `Config::validate` succeeded.
    pub fn settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            pool_size: self.pool_size.max(1) as usize,
            lease_min_hold: Duration::from_secs(self.lease_min_hold_sec.max(0) as u64),
            lease_max_hold: Duration::from_secs(self.lease_max_hold_sec.max(0) as u64),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SensorEntry {
    pub id: String,
    pub display_name: String,
    pub query: String,
    pub on_threshold: f64,
    pub off_threshold: f64,
    pub update_cron_expression: String,
    #[serde(default)]
    pub custom_identifiers: BTreeMap<String, String>,
}

impl SensorEntry {
    fn to_record(&self) -> DeviceRecord {
        let parameters = BTreeMap::from([
            (QUERY_PARAMETER.to_string(), self.query.clone()),
            (ON_THRESHOLD_PARAMETER.to_string(), self.on_threshold.to_string()),
            (OFF_THRESHOLD_PARAMETER.to_string(), self.off_threshold.to_string()),
            (
                UPDATE_CRON_EXPRESSION_PARAMETER.to_string(),
                self.update_cron_expression.trim().to_string(),
            ),
            (VERSION_PARAMETER.to_string(), PARAMETER_VERSION.to_string()),
        ]);
        DeviceRecord {
            device_type: POWER_SENSOR_TYPE.to_string(),
            device_id: self.id.clone(),
            display_name: self.display_name.clone(),
            parameters,
            custom_identifiers: self.custom_identifiers.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_scheduler(&mut errors);
        self.validate_sensors(&mut errors);

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

    fn validate_scheduler(&self, errors: &mut Vec<String>) {
        let s = &self.scheduler;
        if s.pool_size < 1 {
            errors.push(format!(
                "scheduler: pool_size must be at least 1, got {}",
                s.pool_size
            ));
        }
        if s.lease_min_hold_sec <= 0 {
            errors.push(format!(
                "scheduler: lease_min_hold_sec must be positive, got {}",
                s.lease_min_hold_sec
            ));
        }
        if s.lease_min_hold_sec > s.lease_max_hold_sec {
            errors.push(format!(
                "scheduler: lease_min_hold_sec ({}) exceeds lease_max_hold_sec ({})",
                s.lease_min_hold_sec, s.lease_max_hold_sec
            ));
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, s) in self.sensors.iter().enumerate() {
            let ctx = || {
                if s.id.is_empty() {
                    format!("sensors[{i}]")
                } else {
                    format!("sensor '{}'", s.id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if s.id.trim().is_empty() {
                errors.push(format!("{}: id is empty", ctx()));
            } else if !seen_ids.insert(&s.id) {
                errors.push(format!("{}: duplicate id", ctx()));
            }

            if s.display_name.trim().is_empty() {
                errors.push(format!("{}: display_name is empty", ctx()));
            }
            if s.query.trim().is_empty() {
                errors.push(format!("{}: query is empty", ctx()));
            }

            // ── Thresholds ──────────────────────────────────────
            if !s.on_threshold.is_finite() {
                errors.push(format!(
                    "{}: on_threshold must be finite, got {}",
                    ctx(),
                    s.on_threshold
                ));
            }
            if !s.off_threshold.is_finite() {
                errors.push(format!(
                    "{}: off_threshold must be finite, got {}",
                    ctx(),
                    s.off_threshold
                ));
            }
            if s.on_threshold < s.off_threshold {
                warn!(
                    sensor = %s.id,
                    on_threshold = s.on_threshold,
                    off_threshold = s.off_threshold,
                    "on_threshold below off_threshold; relay state will flap"
                );
            }

            // ── Cadence ─────────────────────────────────────────
            if let Err(e) = s.update_cron_expression.parse::<Cadence>() {
                errors.push(format!(
                    "{}: update_cron_expression '{}' is invalid: {e}",
                    ctx(),
                    s.update_cron_expression
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
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

/// Upsert all sensors from the config into the database.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for s in &config.sensors {
        db.upsert_device(&s.to_record())
            .await
            .with_context(|| format!("failed to upsert sensor '{}'", s.id))?;
    }

    tracing::info!(sensors = config.sensors.len(), "config applied");

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
