//! Builds devices from persisted definitions and hands them to the
//! scheduler.
//!
//! Each supported device type registers a builder under its type tag.
//! Definitions of unknown types are left alone so several factories can
//! share one device table.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

use crate::db::{Db, DeviceRecord};
use crate::device::Device;
use crate::scheduler::Scheduler;
use crate::sensor::{ParameterError, PowerSensor, PowerSensorConfig, POWER_SENSOR_TYPE};
use crate::source::SampleSource;
use crate::store::PropertyValueStore;

/// Shared services every built device may use.
#[derive(Clone)]
pub struct DeviceContext {
    pub source: Arc<dyn SampleSource>,
    pub store: Arc<dyn PropertyValueStore>,
}

pub type DeviceBuilder = fn(&DeviceRecord, &DeviceContext) -> Result<Arc<dyn Device>, ParameterError>;

pub struct DeviceFactory {
    builders: HashMap<&'static str, DeviceBuilder>,
    context: DeviceContext,
    scheduler: Arc<Scheduler>,
}

impl DeviceFactory {
    pub fn new(context: DeviceContext, scheduler: Arc<Scheduler>) -> Self {
        let mut factory = Self {
            builders: HashMap::new(),
            context,
            scheduler,
        };
        factory.register(POWER_SENSOR_TYPE, build_power_sensor);
        factory
    }

    pub fn register(&mut self, device_type: &'static str, builder: DeviceBuilder) {
        self.builders.insert(device_type, builder);
    }

    pub fn supports_device_type(&self, device_type: &str) -> bool {
        self.builders.contains_key(device_type)
    }

    pub fn supported_device_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.builders.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Build and schedule one device. `Ok(None)` for types this factory does
    /// not handle; registering an already scheduled device is a no-op.
    pub async fn create_device(
        &self,
        record: &DeviceRecord,
    ) -> Result<Option<Arc<dyn Device>>, ParameterError> {
        let Some(build) = self.builders.get(record.device_type.as_str()) else {
            return Ok(None);
        };
        let device = build(record, &self.context)?;
        self.scheduler.register(Arc::clone(&device)).await;
        Ok(Some(device))
    }

    /// Rebuild every persisted device this factory supports. A definition
    /// that fails to build is logged and skipped.
    pub async fn create_devices(&self, db: &Db) -> Result<Vec<Arc<dyn Device>>> {
        let mut devices = Vec::new();
        for record in db.load_devices().await? {
            match self.create_device(&record).await {
                Ok(Some(device)) => devices.push(device),
                Ok(None) => {}
                Err(e) => error!(
                    device_type = %record.device_type,
                    device = %record.device_id,
                    "factory: skipping device: {e}"
                ),
            }
        }
        info!(count = devices.len(), "factory: devices created");
        Ok(devices)
    }

    /// Startup reconciliation: load persisted devices of every supported
    /// type and register them with the scheduler. Returns how many were newly
    /// scheduled; devices already registered are skipped by the scheduler.
    pub async fn schedule_persisted(&self, db: &Db) -> Result<usize> {
        let mut scheduled = 0;
        for device_type in self.supported_device_types() {
            let Some(build) = self.builders.get(device_type) else {
                continue;
            };
            for record in db.load_devices_by_type(device_type).await? {
                let device = match build(&record, &self.context) {
                    Ok(device) => device,
                    Err(e) => {
                        error!(
                            device_type = %device_type,
                            device = %record.device_id,
                            "factory: skipping device: {e}"
                        );
                        continue;
                    }
                };
                if self.scheduler.register(device).await {
                    scheduled += 1;
                }
            }
        }
        info!(scheduled, "factory: persisted devices scheduled");
        Ok(scheduled)
    }
}

fn build_power_sensor(
    record: &DeviceRecord,
    context: &DeviceContext,
) -> Result<Arc<dyn Device>, ParameterError> {
    let config = PowerSensorConfig::from_parameters(
        &record.device_id,
        &record.display_name,
        &record.parameters,
        record.custom_identifiers.clone(),
    )?;
    Ok(Arc::new(PowerSensor::new(
        config,
        Arc::clone(&context.source),
        Arc::clone(&context.store),
    )))
}

// ===========================================================================
// Tests
// ===========================================================================
