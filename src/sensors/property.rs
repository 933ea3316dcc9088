//! System property and environment variable reads. Values are never captured,
//! only the name and whether it was set.

use super::{Call, CallOutcome, Capture, Interceptor, Sensor, TargetOperation, Transform};
use crate::config::SensorOptions;
use crate::error::{ConfigurationError, InterceptorFault};
use crate::event::{Attributes, EventType};
use std::sync::Arc;

pub const NAMESPACE: &str = "property";

pub struct PropertySensor;

impl PropertySensor {
    pub fn build(options: &SensorOptions) -> Result<Sensor, ConfigurationError> {
        let interceptor: Arc<dyn Interceptor> = Arc::new(PropertySensor);
        let mut sensor = Sensor::configured("Properties", NAMESPACE, options)?.with_transform(
            Transform::new(
                TargetOperation::new("runtime::System", "get_property"),
                interceptor.clone(),
            ),
        );
        if options.bool(&format!("{}.environment", NAMESPACE), true)? {
            sensor = sensor
                .with_transform(Transform::new(
                    TargetOperation::new("std::env", "var"),
                    interceptor.clone(),
                ))
                .with_transform(Transform::new(
                    TargetOperation::new("std::env", "var_os"),
                    interceptor,
                ));
        }
        Ok(sensor)
    }
}

impl Interceptor for PropertySensor {
    fn on_exit(
        &self,
        call: &Call,
        outcome: &CallOutcome<'_>,
    ) -> Result<Option<Capture>, InterceptorFault> {
        let name = call.require("name")?;
        let event_type = if call.target.type_name == "std::env" {
            EventType::Environment
        } else {
            EventType::SystemProperty
        };
        let present = matches!(outcome, CallOutcome::Returned(Some(_)));
        let attrs = Attributes::new()
            .with("name", name)
            .with("present", present.to_string());
        Ok(Some(Capture::from_call(event_type, attrs, call)))
    }
}
