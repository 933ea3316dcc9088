//! Classloader creation sensor. The loader types are optional platform
//! capabilities; transforms for absent ones are skipped at registration.

use super::{Call, CallOutcome, Capture, Interceptor, Sensor, TargetOperation, Transform};
use crate::config::SensorOptions;
use crate::error::{ConfigurationError, InterceptorFault};
use crate::event::{Attributes, EventType};
use std::sync::Arc;

pub const NAMESPACE: &str = "classloader";

pub struct ClassLoaderSensor;

impl ClassLoaderSensor {
    pub fn build(options: &SensorOptions) -> Result<Sensor, ConfigurationError> {
        let interceptor: Arc<dyn Interceptor> = Arc::new(ClassLoaderSensor);
        Ok(Sensor::configured("Classloader", NAMESPACE, options)?
            .with_transform(Transform::new(
                TargetOperation::new("loader::ClassLoader", "new"),
                interceptor.clone(),
            ))
            .with_transform(Transform::new(
                TargetOperation::new("loader::UrlClassLoader", "new"),
                interceptor,
            )))
    }
}

impl Interceptor for ClassLoaderSensor {
    fn on_exit(
        &self,
        call: &Call,
        outcome: &CallOutcome<'_>,
    ) -> Result<Option<Capture>, InterceptorFault> {
        if !outcome.is_ok() {
            return Ok(None);
        }
        let mut attrs = Attributes::new().with("loader", call.target.type_name.clone());
        if let Some(parent) = call.get("parent") {
            attrs.push("parent", parent);
        }
        if let Some(urls) = call.get("urls") {
            attrs.push("urls", urls);
        }
        Ok(Some(Capture::from_call(EventType::ClassloaderCreate, attrs, call)))
    }
}
