//! Permission checks: which permission was requested and whether it was granted.

use super::{Call, CallOutcome, Capture, Interceptor, Sensor, TargetOperation, Transform};
use crate::config::SensorOptions;
use crate::error::{ConfigurationError, InterceptorFault};
use crate::event::{Attributes, EventType};
use std::sync::Arc;

pub const NAMESPACE: &str = "permission";

pub struct PermissionSensor;

impl PermissionSensor {
    pub fn build(options: &SensorOptions) -> Result<Sensor, ConfigurationError> {
        let interceptor: Arc<dyn Interceptor> = Arc::new(PermissionSensor);
        Ok(Sensor::configured("Permission", NAMESPACE, options)?.with_transform(
            Transform::new(
                TargetOperation::new("security::AccessController", "check_permission"),
                interceptor,
            ),
        ))
    }
}

impl Interceptor for PermissionSensor {
    fn on_exit(
        &self,
        call: &Call,
        outcome: &CallOutcome<'_>,
    ) -> Result<Option<Capture>, InterceptorFault> {
        let permission = call.require("permission")?;
        let mut attrs = Attributes::new().with("permission", permission);
        if let Some(action) = call.get("action") {
            attrs.push("action", action);
        }
        attrs.push("granted", outcome.is_ok().to_string());
        Ok(Some(Capture::from_call(EventType::Permission, attrs, call)))
    }
}
