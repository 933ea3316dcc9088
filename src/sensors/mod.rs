//! Sensors: named monitoring units owning transforms (target operation +
//! interceptor + signature matcher). Built-in sensors cover file, socket,
//! classloader, property/environment and permission operations.

mod classloader;
mod file;
mod network;
mod permission;
mod property;

use crate::config::SensorOptions;
use crate::error::{ConfigurationError, InterceptorFault};
use crate::event::{Attributes, EventType};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

pub use classloader::ClassLoaderSensor;
pub use file::FileSensor;
pub use network::SocketSensor;
pub use permission::PermissionSensor;
pub use property::PropertySensor;

/// An interceptable operation: owning type plus method name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetOperation {
    pub type_name: String,
    pub method: String,
}

impl TargetOperation {
    pub fn new(type_name: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            method: method.into(),
        }
    }
}

impl fmt::Display for TargetOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.type_name, self.method)
    }
}

/// Selects which overloads of a target operation a transform observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodMatcher {
    Any,
    Exact(String),
    Prefix(String),
}

impl MethodMatcher {
    pub fn matches(&self, signature: &str) -> bool {
        match self {
            MethodMatcher::Any => true,
            MethodMatcher::Exact(s) => s == signature,
            MethodMatcher::Prefix(p) => signature.starts_with(p.as_str()),
        }
    }
}

/// Read-only description of an intercepted call.
#[derive(Debug, Clone)]
pub struct Call {
    pub target: TargetOperation,
    pub signature: String,
    pub args: Vec<(String, String)>,
    /// Advisory call-site description
    pub call_site: Option<String>,
}

impl Call {
    pub fn new(target: TargetOperation, signature: impl Into<String>) -> Self {
        Self {
            target,
            signature: signature.into(),
            args: Vec::new(),
            call_site: None,
        }
    }

    pub fn arg(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.push((name.into(), value.into()));
        self
    }

    pub fn at(mut self, call_site: impl Into<String>) -> Self {
        self.call_site = Some(call_site.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn require(&self, name: &'static str) -> Result<&str, InterceptorFault> {
        self.get(name).ok_or(InterceptorFault::MissingArgument(name))
    }
}

/// How the intercepted operation finished.
#[derive(Debug, Clone, Copy)]
pub enum CallOutcome<'a> {
    Returned(Option<&'a str>),
    Failed(&'a str),
}

impl CallOutcome<'_> {
    pub fn is_ok(&self) -> bool {
        matches!(self, CallOutcome::Returned(_))
    }

    /// `"ok"` or `"error: <reason>"`, the status attribute most sensors emit.
    pub fn status(&self) -> String {
        match self {
            CallOutcome::Returned(_) => "ok".to_string(),
            CallOutcome::Failed(e) => format!("error: {}", e),
        }
    }
}

/// What an interceptor observed; the runtime turns it into an [`crate::Event`].
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    pub event_type: EventType,
    pub attributes: Attributes,
    pub capture_context: Option<String>,
}

impl Capture {
    pub fn new(event_type: EventType, attributes: Attributes) -> Self {
        Self {
            event_type,
            attributes,
            capture_context: None,
        }
    }

    pub fn from_call(event_type: EventType, attributes: Attributes, call: &Call) -> Self {
        Self {
            event_type,
            attributes,
            capture_context: call.call_site.clone(),
        }
    }
}

/// Capture logic run at entry and/or exit of a target operation.
///
/// Implementations may fail or panic; the hook wrapper discards both.
pub trait Interceptor: Send + Sync {
    fn on_entry(&self, _call: &Call) -> Result<Option<Capture>, InterceptorFault> {
        Ok(None)
    }

    fn on_exit(
        &self,
        _call: &Call,
        _outcome: &CallOutcome<'_>,
    ) -> Result<Option<Capture>, InterceptorFault> {
        Ok(None)
    }
}

/// Records every matching call as an API_CALL event.
pub struct ApiCallInterceptor;

impl Interceptor for ApiCallInterceptor {
    fn on_exit(
        &self,
        call: &Call,
        outcome: &CallOutcome<'_>,
    ) -> Result<Option<Capture>, InterceptorFault> {
        let attrs = Attributes::new()
            .with("operation", call.target.to_string())
            .with("signature", call.signature.clone())
            .with("status", outcome.status());
        Ok(Some(Capture::from_call(EventType::ApiCall, attrs, call)))
    }
}

/// Binding of a target operation to interceptor logic. Immutable once built.
#[derive(Clone)]
pub struct Transform {
    pub target: TargetOperation,
    pub interceptor: Arc<dyn Interceptor>,
    pub matcher: MethodMatcher,
}

impl Transform {
    pub fn new(target: TargetOperation, interceptor: Arc<dyn Interceptor>) -> Self {
        Self {
            target,
            interceptor,
            matcher: MethodMatcher::Any,
        }
    }

    pub fn matching(mut self, matcher: MethodMatcher) -> Self {
        self.matcher = matcher;
        self
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transform")
            .field("target", &self.target)
            .field("matcher", &self.matcher)
            .finish_non_exhaustive()
    }
}

/// A logical monitoring unit.
#[derive(Debug, Clone)]
pub struct Sensor {
    pub id: Uuid,
    pub name: String,
    /// Option prefix, e.g. `file` for `file.enabled`
    pub namespace: String,
    pub enabled: bool,
    pub transforms: Vec<Transform>,
}

impl Sensor {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            namespace: namespace.into(),
            enabled: true,
            transforms: Vec::new(),
        }
    }

    /// Reads `<namespace>.enabled` (default true).
    pub fn configured(
        name: impl Into<String>,
        namespace: &str,
        options: &SensorOptions,
    ) -> Result<Self, ConfigurationError> {
        let mut sensor = Self::new(name, namespace);
        sensor.enabled = options.bool(&format!("{}.enabled", namespace), true)?;
        Ok(sensor)
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transforms.push(transform);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// All built-in sensors configured from `options`. Failures are per sensor.
pub fn builtin(options: &SensorOptions) -> Vec<Result<Sensor, ConfigurationError>> {
    vec![
        FileSensor::build(options),
        SocketSensor::build(options),
        ClassLoaderSensor::build(options),
        PropertySensor::build(options),
        PermissionSensor::build(options),
    ]
}
