//! File access sensor: open/read/write/delete on the filesystem API.

use super::{Call, CallOutcome, Capture, Interceptor, Sensor, TargetOperation, Transform};
use crate::config::SensorOptions;
use crate::error::{ConfigurationError, InterceptorFault};
use crate::event::{Attributes, EventType};
use std::sync::Arc;

pub const NAMESPACE: &str = "file";

pub struct FileSensor {
    /// Paths under these prefixes are never reported (e.g. the agent's own log directory)
    ignore_prefixes: Vec<String>,
}

impl FileSensor {
    pub fn new(ignore_prefixes: Vec<String>) -> Self {
        Self { ignore_prefixes }
    }

    pub fn build(options: &SensorOptions) -> Result<Sensor, ConfigurationError> {
        let interceptor: Arc<dyn Interceptor> = Arc::new(Self::new(
            options.list(&format!("{}.ignore_prefixes", NAMESPACE)),
        ));
        let sensor = Sensor::configured("File access", NAMESPACE, options)?;
        Ok(["open", "read", "write", "remove_file"]
            .iter()
            .fold(sensor, |s, method| {
                let type_name = if *method == "open" { "std::fs::File" } else { "std::fs" };
                s.with_transform(Transform::new(
                    TargetOperation::new(type_name, *method),
                    interceptor.clone(),
                ))
            }))
    }

    fn ignored(&self, path: &str) -> bool {
        self.ignore_prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }

    fn event_type(call: &Call) -> EventType {
        match call.target.method.as_str() {
            "remove_file" => EventType::FileDelete,
            "write" => EventType::FileWrite,
            "open" => match call.get("mode") {
                Some(m) if m.contains('w') || m.contains('a') => EventType::FileWrite,
                _ => EventType::FileRead,
            },
            _ => EventType::FileRead,
        }
    }
}

impl Interceptor for FileSensor {
    fn on_exit(
        &self,
        call: &Call,
        outcome: &CallOutcome<'_>,
    ) -> Result<Option<Capture>, InterceptorFault> {
        let path = call.require("path")?;
        if self.ignored(path) {
            return Ok(None);
        }
        let mut attrs = Attributes::new().with("path", path);
        if let Some(mode) = call.get("mode") {
            attrs.push("mode", mode);
        }
        attrs.push("status", outcome.status());
        Ok(Some(Capture::from_call(Self::event_type(call), attrs, call)))
    }
}
