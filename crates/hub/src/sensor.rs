//! Power sensor backed by a time-series query. Each check polls the query,
//! infers the relay state with hysteresis, and publishes the latest power
//! reading plus the relay state to the property store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cadence::Cadence;
use crate::device::{CheckOutcome, Device};
use crate::hysteresis::{self, RelayState};
use crate::source::SampleSource;
use crate::store::{
    find_latest_as, DeviceId, DevicePropertyId, PropertyValueStore, PropertyWrite, StoredValue,
    ValueType,
};

pub const POWER_SENSOR_TYPE: &str = "influxdb2-power-sensor";

pub const QUERY_PARAMETER: &str = "query";
pub const ON_THRESHOLD_PARAMETER: &str = "onThreshold";
pub const OFF_THRESHOLD_PARAMETER: &str = "offThreshold";
pub const UPDATE_CRON_EXPRESSION_PARAMETER: &str = "updateCronExpression";
pub const VERSION_PARAMETER: &str = "version";
pub const PARAMETER_VERSION: &str = "1.0.0";

const POWER_PROPERTY: &str = "power";
const RELAY_PROPERTY: &str = "relay";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParameterError {
    #[error("missing parameter '{0}'")]
    Missing(&'static str),
    #[error("parameter '{name}' is not a number: '{value}'")]
    InvalidNumber { name: &'static str, value: String },
    #[error("parameter '{name}' is not a valid cron expression '{value}': {reason}")]
    InvalidCadence {
        name: &'static str,
        value: String,
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PowerSensorConfig {
    pub id: String,
    pub display_name: String,
    pub query: String,
    pub on_threshold: f64,
    pub off_threshold: f64,
    pub cadence: Cadence,
    pub custom_identifiers: BTreeMap<String, String>,
}

impl PowerSensorConfig {
    /// Rebuild a config from its persisted parameter map.
    pub fn from_parameters(
        id: &str,
        display_name: &str,
        parameters: &BTreeMap<String, String>,
        custom_identifiers: BTreeMap<String, String>,
    ) -> Result<Self, ParameterError> {
        let get = |name: &'static str| {
            parameters
                .get(name)
                .map(String::as_str)
                .ok_or(ParameterError::Missing(name))
        };
        let number = |name: &'static str| -> Result<f64, ParameterError> {
            let raw = get(name)?;
            raw.trim().parse().map_err(|_| ParameterError::InvalidNumber {
                name,
                value: raw.to_string(),
            })
        };

        if let Some(version) = parameters.get(VERSION_PARAMETER) {
            if version != PARAMETER_VERSION {
                warn!(
                    sensor = %id,
                    version = %version,
                    expected = PARAMETER_VERSION,
                    "unexpected parameter version"
                );
            }
        }

        let cron = get(UPDATE_CRON_EXPRESSION_PARAMETER)?;
        let cadence = cron
            .parse::<Cadence>()
            .map_err(|e| ParameterError::InvalidCadence {
                name: UPDATE_CRON_EXPRESSION_PARAMETER,
                value: cron.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            query: get(QUERY_PARAMETER)?.to_string(),
            on_threshold: number(ON_THRESHOLD_PARAMETER)?,
            off_threshold: number(OFF_THRESHOLD_PARAMETER)?,
            cadence,
            custom_identifiers,
        })
    }

    pub fn parameters(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (QUERY_PARAMETER.to_string(), self.query.clone()),
            (ON_THRESHOLD_PARAMETER.to_string(), self.on_threshold.to_string()),
            (OFF_THRESHOLD_PARAMETER.to_string(), self.off_threshold.to_string()),
            (
                UPDATE_CRON_EXPRESSION_PARAMETER.to_string(),
                self.cadence.expression().to_string(),
            ),
            (VERSION_PARAMETER.to_string(), PARAMETER_VERSION.to_string()),
        ])
    }
}

// ---------------------------------------------------------------------------
// Sensor
// ---------------------------------------------------------------------------

pub struct PowerSensor {
    config: PowerSensorConfig,
    source: Arc<dyn SampleSource>,
    store: Arc<dyn PropertyValueStore>,
    power_property: DevicePropertyId,
    relay_property: DevicePropertyId,
}

impl PowerSensor {
    pub fn new(
        config: PowerSensorConfig,
        source: Arc<dyn SampleSource>,
        store: Arc<dyn PropertyValueStore>,
    ) -> Self {
        let device = DeviceId {
            id: config.id.clone(),
            device_type: POWER_SENSOR_TYPE.to_string(),
        };
        Self {
            power_property: DevicePropertyId::new(device.clone(), POWER_PROPERTY),
            relay_property: DevicePropertyId::new(device, RELAY_PROPERTY),
            config,
            source,
            store,
        }
    }

    pub fn relay_property(&self) -> &DevicePropertyId {
        &self.relay_property
    }

    pub fn power_property(&self) -> &DevicePropertyId {
        &self.power_property
    }

    async fn relay_state(&self) -> Result<Option<RelayState>> {
        let latest =
            find_latest_as::<bool>(self.store.as_ref(), &self.relay_property, ValueType::RelayState)
                .await?;
        Ok(latest.map(|l| RelayState {
            is_on: l.value,
            effective_at: l.timestamp,
        }))
    }
}

#[async_trait]
impl Device for PowerSensor {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn device_type(&self) -> &'static str {
        POWER_SENSOR_TYPE
    }

    fn display_name(&self) -> &str {
        &self.config.display_name
    }

    fn parameters(&self) -> BTreeMap<String, String> {
        self.config.parameters()
    }

    fn custom_identifiers(&self) -> &BTreeMap<String, String> {
        &self.config.custom_identifiers
    }

    fn cadence(&self) -> &Cadence {
        &self.config.cadence
    }

    async fn check_state(&self) -> Result<CheckOutcome> {
        let name = &self.config.display_name;
        debug!(sensor = %name, "reading power value");

        let samples = self
            .source
            .query(&self.config.query)
            .await
            .with_context(|| format!("{name}: power query failed"))?;
        if samples.is_empty() {
            debug!(sensor = %name, "no new values");
            return Ok(CheckOutcome::NoSamples);
        }

        // Read before any write so a failed read leaves the store untouched.
        let previous = self
            .relay_state()
            .await
            .with_context(|| format!("{name}: reading previous relay state failed"))?;

        let Some(inference) = hysteresis::infer(
            previous,
            &samples,
            self.config.on_threshold,
            self.config.off_threshold,
        ) else {
            return Ok(CheckOutcome::NoSamples);
        };

        // One batch; the SQLite store commits both rows or neither.
        let power = inference.latest_power;
        self.store
            .insert_all(vec![
                PropertyWrite {
                    property: self.power_property.clone(),
                    value_type: ValueType::Power,
                    display_name: name.clone(),
                    value: StoredValue::Float(power.value),
                    time: power.timestamp,
                },
                PropertyWrite {
                    property: self.relay_property.clone(),
                    value_type: ValueType::RelayState,
                    display_name: name.clone(),
                    value: StoredValue::Bool(inference.relay.is_on),
                    time: inference.relay.effective_at,
                },
            ])
            .await
            .with_context(|| format!("{name}: publishing power and relay state failed"))?;

        if inference.is_transition(previous) {
            debug!(
                sensor = %name,
                on = inference.relay.is_on,
                at = %inference.relay.effective_at,
                "relay state changed"
            );
        }

        Ok(CheckOutcome::Published(inference))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::Db;
    use crate::source::{Sample, SourceError};
    use crate::store::{from_millis, Timestamped};
    use chrono::{DateTime, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Source that replays scripted poll results; `None` is a failed read.
    #[derive(Default)]
    pub(crate) struct ScriptedSource {
        polls: Mutex<VecDeque<Option<Vec<Sample>>>>,
        pub(crate) queries: Mutex<Vec<String>>,
    }

    impl ScriptedSource {
        pub(crate) fn new(polls: Vec<Option<Vec<Sample>>>) -> Self {
            Self {
                polls: Mutex::new(polls.into()),
                queries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SampleSource for ScriptedSource {
        async fn query(&self, query: &str) -> Result<Vec<Sample>, SourceError> {
            self.queries.lock().unwrap().push(query.to_string());
            match self.polls.lock().unwrap().pop_front() {
                Some(Some(samples)) => Ok(samples),
                Some(None) => Err(SourceError::Malformed("backend unreachable".into())),
                None => Ok(Vec::new()),
            }
        }
    }

    /// Store whose reads always fail; counts attempted writes.
    #[derive(Default)]
    struct BrokenStore {
        writes: Mutex<usize>,
    }

    #[async_trait]
    impl PropertyValueStore for BrokenStore {
        async fn insert(
            &self,
            _property: &DevicePropertyId,
            _value_type: ValueType,
            _display_name: &str,
            _value: StoredValue,
            _time: DateTime<Utc>,
        ) -> Result<()> {
            *self.writes.lock().unwrap() += 1;
            Ok(())
        }

        async fn find_latest(
            &self,
            _property: &DevicePropertyId,
            _value_type: ValueType,
        ) -> Result<Option<Timestamped<StoredValue>>> {
            anyhow::bail!("store unreachable")
        }

        async fn last_time_value_matched(
            &self,
            _property: &DevicePropertyId,
            _value_type: ValueType,
            _value: &StoredValue,
        ) -> Result<Option<DateTime<Utc>>> {
            anyhow::bail!("store unreachable")
        }
    }

    pub(crate) fn at(secs: i64) -> DateTime<Utc> {
        from_millis(1_700_000_000_000 + secs * 1000).unwrap()
    }

    pub(crate) fn samples(values: &[(i64, f64)]) -> Vec<Sample> {
        values.iter().map(|&(t, v)| Sample::new(at(t), v)).collect()
    }

    pub(crate) fn test_config(id: &str) -> PowerSensorConfig {
        PowerSensorConfig {
            id: id.into(),
            display_name: format!("Sensor {id}"),
            query: format!("from(bucket: \"power\") |> filter(fn: (r) => r.plug == \"{id}\")"),
            on_threshold: 10.0,
            off_threshold: 2.0,
            cadence: "*/30 * * * * *".parse().unwrap(),
            custom_identifiers: BTreeMap::new(),
        }
    }

    async fn memory_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn sensor(source: Arc<ScriptedSource>, db: &Db) -> PowerSensor {
        PowerSensor::new(test_config("washer"), source, Arc::new(db.clone()))
    }

    async fn count_rows(db: &Db) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM property_values")
            .fetch_one(db.pool())
            .await
            .unwrap()
    }

    async fn latest_relay(db: &Db, s: &PowerSensor) -> Option<Timestamped<StoredValue>> {
        db.find_latest(s.relay_property(), ValueType::RelayState)
            .await
            .unwrap()
    }

    // -- Parameters -------------------------------------------------------

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parameters_round_trip() {
        let cfg = test_config("washer");
        let rebuilt = PowerSensorConfig::from_parameters(
            &cfg.id,
            &cfg.display_name,
            &cfg.parameters(),
            BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(rebuilt, cfg);
        assert_eq!(cfg.parameters()[VERSION_PARAMETER], PARAMETER_VERSION);
    }

    #[test]
    fn missing_parameter_is_reported() {
        let p = params(&[
            (QUERY_PARAMETER, "q"),
            (ON_THRESHOLD_PARAMETER, "10"),
            (UPDATE_CRON_EXPRESSION_PARAMETER, "* * * * *"),
        ]);
        let err = PowerSensorConfig::from_parameters("a", "A", &p, BTreeMap::new()).unwrap_err();
        assert_eq!(err, ParameterError::Missing(OFF_THRESHOLD_PARAMETER));
    }

    #[test]
    fn bad_threshold_is_reported() {
        let p = params(&[
            (QUERY_PARAMETER, "q"),
            (ON_THRESHOLD_PARAMETER, "ten"),
            (OFF_THRESHOLD_PARAMETER, "2"),
            (UPDATE_CRON_EXPRESSION_PARAMETER, "* * * * *"),
        ]);
        let err = PowerSensorConfig::from_parameters("a", "A", &p, BTreeMap::new()).unwrap_err();
        assert!(matches!(err, ParameterError::InvalidNumber { name: ON_THRESHOLD_PARAMETER, .. }));
    }

    #[test]
    fn bad_cron_is_reported() {
        let p = params(&[
            (QUERY_PARAMETER, "q"),
            (ON_THRESHOLD_PARAMETER, "10"),
            (OFF_THRESHOLD_PARAMETER, "2"),
            (UPDATE_CRON_EXPRESSION_PARAMETER, "hourly"),
        ]);
        let err = PowerSensorConfig::from_parameters("a", "A", &p, BTreeMap::new()).unwrap_err();
        assert!(matches!(err, ParameterError::InvalidCadence { .. }));
    }

    // -- check_state --------------------------------------------------------

    #[tokio::test]
    async fn first_check_publishes_power_and_relay() {
        let db = memory_db().await;
        let source = Arc::new(ScriptedSource::new(vec![Some(samples(&[(0, 3.0), (60, 7.0)]))]));
        let s = sensor(Arc::clone(&source), &db);

        let outcome = s.check_state().await.unwrap();
        assert!(matches!(outcome, CheckOutcome::Published(_)));

        let power = db
            .find_latest(s.power_property(), ValueType::Power)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(power.value, StoredValue::Float(7.0));
        assert_eq!(power.timestamp, at(60));

        let relay = latest_relay(&db, &s).await.unwrap();
        assert_eq!(relay.value, StoredValue::Bool(false));
        assert_eq!(relay.timestamp, at(60));

        assert_eq!(source.queries.lock().unwrap().as_slice(), [test_config("washer").query]);
    }

    #[tokio::test]
    async fn relay_follows_hysteresis_across_polls() {
        let db = memory_db().await;
        let source = Arc::new(ScriptedSource::new(vec![
            Some(samples(&[(0, 1.0)])),
            Some(samples(&[(60, 5.0), (120, 12.0), (180, 20.0)])),
            Some(samples(&[(240, 5.0), (300, 3.0)])),
            Some(samples(&[(360, 1.0), (420, 50.0)])),
        ]));
        let s = sensor(source, &db);

        s.check_state().await.unwrap();
        assert_eq!(latest_relay(&db, &s).await.unwrap().value, StoredValue::Bool(false));

        // Turns on at the first crossing, not at the poll's last sample.
        s.check_state().await.unwrap();
        let r = latest_relay(&db, &s).await.unwrap();
        assert_eq!((r.value, r.timestamp), (StoredValue::Bool(true), at(120)));

        // Inside the hysteresis band: stays on, re-affirmed at the last sample.
        s.check_state().await.unwrap();
        let r = latest_relay(&db, &s).await.unwrap();
        assert_eq!((r.value, r.timestamp), (StoredValue::Bool(true), at(300)));

        // Drops to off at 360 even though power recovers later in the batch.
        s.check_state().await.unwrap();
        let r = latest_relay(&db, &s).await.unwrap();
        assert_eq!((r.value, r.timestamp), (StoredValue::Bool(false), at(360)));

        // One power and one relay write per non-empty poll.
        assert_eq!(count_rows(&db).await, 8);
    }

    #[tokio::test]
    async fn empty_poll_writes_nothing() {
        let db = memory_db().await;
        let source = Arc::new(ScriptedSource::new(vec![
            Some(samples(&[(0, 50.0)])),
            Some(Vec::new()),
        ]));
        let s = sensor(source, &db);

        s.check_state().await.unwrap();
        let before = latest_relay(&db, &s).await.unwrap();

        assert_eq!(s.check_state().await.unwrap(), CheckOutcome::NoSamples);
        assert_eq!(count_rows(&db).await, 2);
        assert_eq!(latest_relay(&db, &s).await.unwrap(), before);
    }

    #[tokio::test]
    async fn failed_read_keeps_previous_state() {
        let db = memory_db().await;
        let source = Arc::new(ScriptedSource::new(vec![
            Some(samples(&[(0, 50.0)])),
            None,
        ]));
        let s = sensor(source, &db);

        s.check_state().await.unwrap();
        assert!(s.check_state().await.is_err());

        assert_eq!(count_rows(&db).await, 2);
        let relay = latest_relay(&db, &s).await.unwrap();
        assert_eq!(relay.value, StoredValue::Bool(true));
    }

    #[tokio::test]
    async fn rejected_relay_write_discards_power_write() {
        let db = memory_db().await;
        sqlx::query(
            r#"
            CREATE TRIGGER reject_relay BEFORE INSERT ON property_values
            WHEN NEW.device_property_id = 'relay'
            BEGIN SELECT RAISE(ABORT, 'relay rejected'); END
            "#,
        )
        .execute(db.pool())
        .await
        .unwrap();

        let source = Arc::new(ScriptedSource::new(vec![Some(samples(&[(0, 50.0)]))]));
        let s = sensor(source, &db);

        assert!(s.check_state().await.is_err());
        assert_eq!(count_rows(&db).await, 0);
    }

    #[tokio::test]
    async fn store_read_failure_aborts_before_writing() {
        let store = Arc::new(BrokenStore::default());
        let source = Arc::new(ScriptedSource::new(vec![Some(samples(&[(0, 50.0)]))]));
        let s = PowerSensor::new(test_config("washer"), source, Arc::clone(&store) as Arc<dyn PropertyValueStore>);

        assert!(s.check_state().await.is_err());
        assert_eq!(*store.writes.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn unreadable_previous_state_is_treated_as_cold_start() {
        let db = memory_db().await;
        let source = Arc::new(ScriptedSource::new(vec![Some(samples(&[(60, 5.0), (120, 12.0), (180, 1.0)]))]));
        let s = sensor(source, &db);
        db.insert(
            s.relay_property(),
            ValueType::RelayState,
            "Sensor washer",
            StoredValue::Text("jammed".into()),
            at(0),
        )
        .await
        .unwrap();

        s.check_state().await.unwrap();
        // Cold start: any sample above the on threshold, stamped at the last
        // sample.
        let r = latest_relay(&db, &s).await.unwrap();
        assert_eq!((r.value, r.timestamp), (StoredValue::Bool(true), at(180)));
    }

    #[test]
    fn device_identity() {
        let db_less = PowerSensor::new(
            test_config("washer"),
            Arc::new(ScriptedSource::default()),
            Arc::new(BrokenStore::default()),
        );
        assert_eq!(db_less.id(), "washer");
        assert_eq!(db_less.device_type(), POWER_SENSOR_TYPE);
        assert_eq!(db_less.display_name(), "Sensor washer");
        assert_eq!(crate::device::lock_key(&db_less), "influxdb2-power-sensor-washer");
        assert_eq!(db_less.relay_property().property, "relay");
        assert_eq!(db_less.power_property().property, "power");
    }
}
