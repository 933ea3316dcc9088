//! Socket sensor: outbound connects and listener binds.

use super::{Call, CallOutcome, Capture, Interceptor, Sensor, TargetOperation, Transform};
use crate::config::SensorOptions;
use crate::error::{ConfigurationError, InterceptorFault};
use crate::event::{Attributes, EventType};
use std::sync::Arc;

pub const NAMESPACE: &str = "socket";

pub struct SocketSensor {
    capture_failures: bool,
}

impl SocketSensor {
    pub fn new(capture_failures: bool) -> Self {
        Self { capture_failures }
    }

    pub fn build(options: &SensorOptions) -> Result<Sensor, ConfigurationError> {
        let capture_failures = options.bool(&format!("{}.capture_failures", NAMESPACE), true)?;
        let interceptor: Arc<dyn Interceptor> = Arc::new(Self::new(capture_failures));
        Ok(Sensor::configured("Socket", NAMESPACE, options)?
            .with_transform(Transform::new(
                TargetOperation::new("std::net::TcpStream", "connect"),
                interceptor.clone(),
            ))
            .with_transform(Transform::new(
                TargetOperation::new("std::net::TcpListener", "bind"),
                interceptor,
            )))
    }
}

impl Interceptor for SocketSensor {
    fn on_exit(
        &self,
        call: &Call,
        outcome: &CallOutcome<'_>,
    ) -> Result<Option<Capture>, InterceptorFault> {
        if !outcome.is_ok() && !self.capture_failures {
            return Ok(None);
        }
        let host = call.require("host")?;
        let port = call.require("port")?;
        let (event_type, ok_status) = match call.target.method.as_str() {
            "bind" => (EventType::SocketBind, "bound"),
            _ => (EventType::SocketConnect, "connected"),
        };
        let status = match outcome {
            CallOutcome::Returned(_) => ok_status.to_string(),
            CallOutcome::Failed(e) => format!("failed: {}", e),
        };
        let attrs = Attributes::new()
            .with("host", host)
            .with("port", port)
            .with("status", status);
        Ok(Some(Capture::from_call(event_type, attrs, call)))
    }
}
