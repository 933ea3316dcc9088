//! Interception boundary: the capability that installs hooks into the
//! monitored program, the guarded hook wrapper every interceptor runs inside,
//! and the registry of active transforms.

mod hooks;
mod registry;

pub use hooks::HookTable;
pub use registry::{InterceptorRegistry, RegisteredSensor, RegistrationReport};

use crate::error::InterceptorFault;
use crate::event::EventFactory;
use crate::guard::ExecutionContext;
use crate::pipeline::{EnqueueOutcome, EventBuffer};
use crate::sensors::{Call, CallOutcome, Capture, Interceptor, MethodMatcher, TargetOperation};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Platform mechanism that physically intercepts operations (syscall
/// interposition, library preloading, runtime hooks...).
pub trait InstrumentationCapability: Send + Sync {
    /// Presence probe. `None` when the target does not exist on this platform.
    fn resolve(&self, target: &TargetOperation) -> Option<TargetOperation>;

    /// Route future invocations of `target` through `hook`.
    fn install_transform(&self, target: &TargetOperation, hook: Arc<InstalledHook>);
}

/// What captured events flow into: the origin's event factory and the buffer.
pub struct CaptureRuntime {
    factory: EventFactory,
    buffer: Arc<EventBuffer>,
}

impl CaptureRuntime {
    pub fn new(factory: EventFactory, buffer: Arc<EventBuffer>) -> Self {
        Self { factory, buffer }
    }

    pub fn factory(&self) -> &EventFactory {
        &self.factory
    }

    pub fn buffer(&self) -> &Arc<EventBuffer> {
        &self.buffer
    }
}

/// An interceptor bound to its sensor and the capture runtime.
///
/// Firing never affects the intercepted operation: guard-held contexts are
/// skipped, and interceptor errors and panics are swallowed here.
pub struct InstalledHook {
    sensor_id: Uuid,
    matcher: MethodMatcher,
    interceptor: Arc<dyn Interceptor>,
    runtime: Arc<CaptureRuntime>,
}

/// What happened when a hook fired. Informational only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookResult {
    /// Signature not observed by this transform
    NotMatched,
    /// The context was already inside instrumentation
    Reentrant,
    /// Interceptor chose not to capture
    Ignored,
    Captured(EnqueueOutcome),
    Fault(InterceptorFault),
}

impl InstalledHook {
    pub fn new(
        sensor_id: Uuid,
        matcher: MethodMatcher,
        interceptor: Arc<dyn Interceptor>,
        runtime: Arc<CaptureRuntime>,
    ) -> Self {
        Self {
            sensor_id,
            matcher,
            interceptor,
            runtime,
        }
    }

    pub fn sensor_id(&self) -> Uuid {
        self.sensor_id
    }

    pub fn on_entry(&self, ctx: &ExecutionContext, call: &Call) -> HookResult {
        self.fire(ctx, call, |i| i.on_entry(call))
    }

    pub fn on_exit(
        &self,
        ctx: &ExecutionContext,
        call: &Call,
        outcome: &CallOutcome<'_>,
    ) -> HookResult {
        self.fire(ctx, call, |i| i.on_exit(call, outcome))
    }

    fn fire<F>(&self, ctx: &ExecutionContext, call: &Call, f: F) -> HookResult
    where
        F: FnOnce(&dyn Interceptor) -> Result<Option<Capture>, InterceptorFault>,
    {
        if !self.matcher.matches(&call.signature) {
            return HookResult::NotMatched;
        }
        let Some(_scope) = ctx.try_enter() else {
            return HookResult::Reentrant;
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| f(self.interceptor.as_ref())))
            .unwrap_or_else(|payload| Err(InterceptorFault::Panicked(panic_message(payload))));
        match result {
            Ok(Some(capture)) => {
                let factory = &self.runtime.factory;
                let outcome = self.runtime.buffer.enqueue_with(|| {
                    factory.build(
                        ctx.id(),
                        capture.event_type,
                        capture.capture_context,
                        capture.attributes,
                    )
                });
                HookResult::Captured(outcome)
            }
            Ok(None) => HookResult::Ignored,
            Err(fault) => {
                debug!(sensor = %self.sensor_id, target = %call.target, %fault, "interceptor fault discarded");
                HookResult::Fault(fault)
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
