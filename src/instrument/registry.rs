//! Interceptor registry: which sensors exist, whether they are enabled, and the
//! active transform table exposed to the instrumentation capability.

use super::{CaptureRuntime, InstalledHook, InstrumentationCapability};
use crate::error::ConfigurationError;
use crate::sensors::{Sensor, TargetOperation};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredSensor {
    pub id: Uuid,
    pub name: String,
    pub namespace: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationReport {
    pub sensor_id: Uuid,
    pub installed: usize,
    /// Targets the capability could not resolve; omitted from the active set
    pub skipped: Vec<TargetOperation>,
}

pub struct InterceptorRegistry {
    sensors: Vec<RegisteredSensor>,
    table: BTreeMap<TargetOperation, Vec<Arc<InstalledHook>>>,
    runtime: Arc<CaptureRuntime>,
}

impl InterceptorRegistry {
    pub fn new(runtime: Arc<CaptureRuntime>) -> Self {
        Self {
            sensors: Vec::new(),
            table: BTreeMap::new(),
            runtime,
        }
    }

    /// Install the sensor's transforms through `capability`. Unresolvable
    /// targets are skipped; only sensor-level problems are errors. A disabled
    /// sensor is recorded but installs nothing.
    pub fn register_sensor(
        &mut self,
        sensor: Sensor,
        capability: &dyn InstrumentationCapability,
    ) -> Result<RegistrationReport, ConfigurationError> {
        if sensor.name.trim().is_empty() {
            return Err(ConfigurationError::EmptySensorName);
        }
        if self
            .sensors
            .iter()
            .any(|s| s.id == sensor.id || s.name == sensor.name)
        {
            return Err(ConfigurationError::DuplicateSensor(sensor.name));
        }

        let mut report = RegistrationReport {
            sensor_id: sensor.id,
            installed: 0,
            skipped: Vec::new(),
        };
        if sensor.enabled {
            for transform in sensor.transforms {
                let Some(resolved) = capability.resolve(&transform.target) else {
                    let err = ConfigurationError::UnresolvedTarget(transform.target.to_string());
                    debug!(sensor = %sensor.name, error = %err, "transform skipped");
                    report.skipped.push(transform.target);
                    continue;
                };
                let hook = Arc::new(InstalledHook::new(
                    sensor.id,
                    transform.matcher,
                    transform.interceptor,
                    self.runtime.clone(),
                ));
                capability.install_transform(&resolved, hook.clone());
                self.table.entry(resolved).or_default().push(hook);
                report.installed += 1;
            }
        }
        info!(
            sensor = %sensor.name,
            enabled = sensor.enabled,
            installed = report.installed,
            skipped = report.skipped.len(),
            "sensor registered"
        );
        self.sensors.push(RegisteredSensor {
            id: sensor.id,
            name: sensor.name,
            namespace: sensor.namespace,
            enabled: sensor.enabled,
        });
        Ok(report)
    }

    /// Fixed at registration; unknown ids are not enabled.
    pub fn is_enabled(&self, sensor_id: Uuid) -> bool {
        self.sensors
            .iter()
            .any(|s| s.id == sensor_id && s.enabled)
    }

    pub fn sensors(&self) -> &[RegisteredSensor] {
        &self.sensors
    }

    pub fn hooks_for(&self, target: &TargetOperation) -> &[Arc<InstalledHook>] {
        self.table.get(target).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn targets(&self) -> impl Iterator<Item = &TargetOperation> {
        self.table.keys()
    }

    pub fn transform_count(&self) -> usize {
        self.table.values().map(Vec::len).sum()
    }
}
