//! Reentrancy guard: nested interception on one context yields one event;
//! contexts never see each other's guard.

use std::io;
use std::sync::{Arc, Barrier, OnceLock};
use std::time::Duration;
use uuid::Uuid;
use watchpost::config::{OverflowStrategy, SensorOptions};
use watchpost::error::InterceptorFault;
use watchpost::event::{Attributes, EventFactory, EventType};
use watchpost::guard::ExecutionContext;
use watchpost::instrument::{CaptureRuntime, HookResult, HookTable, InterceptorRegistry};
use watchpost::pipeline::EventBuffer;
use watchpost::sensors::{
    Call, CallOutcome, Capture, FileSensor, Interceptor, Sensor, TargetOperation, Transform,
};

fn registry(buffer: &Arc<EventBuffer>) -> InterceptorRegistry {
    let runtime = Arc::new(CaptureRuntime::new(
        EventFactory::new(Uuid::new_v4()),
        buffer.clone(),
    ));
    InterceptorRegistry::new(runtime)
}

fn buffer() -> Arc<EventBuffer> {
    Arc::new(EventBuffer::new(64, OverflowStrategy::DropNewest, Duration::from_millis(1)))
}

fn connect_call() -> Call {
    Call::new(TargetOperation::new("std::net::TcpStream", "connect"), "connect(addr)")
        .arg("host", "10.0.0.1")
        .arg("port", "443")
}

fn log_write_call() -> Call {
    Call::new(TargetOperation::new("std::fs", "write"), "write(path, contents)")
        .arg("path", "/var/log/watchpost.log")
}

/// Captures socket connects and "logs" each one by writing a file through the
/// same instrumented API, then optionally triggers another connect.
struct ChattyInterceptor {
    table: OnceLock<Arc<HookTable>>,
    nested_connects: usize,
}

impl Interceptor for ChattyInterceptor {
    fn on_exit(
        &self,
        call: &Call,
        _outcome: &CallOutcome<'_>,
    ) -> Result<Option<Capture>, InterceptorFault> {
        let table = self.table.get().expect("table installed");
        table
            .invoke_current(&log_write_call(), || Ok::<_, io::Error>(()))
            .map_err(|e| InterceptorFault::Other(e.to_string()))?;
        for _ in 0..self.nested_connects {
            let _ = table.invoke_current(&connect_call(), || Ok::<_, io::Error>(()));
        }
        let attrs = Attributes::new().with("host", call.get("host").unwrap_or_default());
        Ok(Some(Capture::new(EventType::SocketConnect, attrs)))
    }
}

fn chatty_setup(nested_connects: usize) -> (Arc<EventBuffer>, Arc<HookTable>, InterceptorRegistry) {
    let buffer = buffer();
    let mut registry = registry(&buffer);
    let table = Arc::new(HookTable::with_builtin_types());
    let chatty = Arc::new(ChattyInterceptor {
        table: OnceLock::new(),
        nested_connects,
    });
    let _ = chatty.table.set(table.clone());
    registry
        .register_sensor(
            Sensor::new("Chatty", "chatty").with_transform(Transform::new(
                TargetOperation::new("std::net::TcpStream", "connect"),
                chatty,
            )),
            table.as_ref(),
        )
        .unwrap();
    registry
        .register_sensor(FileSensor::build(&SensorOptions::new()).unwrap(), table.as_ref())
        .unwrap();
    (buffer, table, registry)
}

#[test]
fn nested_interception_produces_only_the_outer_event() {
    for nested in 0..4 {
        let (buffer, table, _registry) = chatty_setup(nested);
        table
            .invoke_current(&connect_call(), || Ok::<_, io::Error>(()))
            .unwrap();
        let events = buffer.pending();
        assert_eq!(events.len(), 1, "nested depth {}", nested);
        assert_eq!(events[0].event_type, EventType::SocketConnect);
    }
}

#[test]
fn guard_is_released_after_interception() {
    let (buffer, table, _registry) = chatty_setup(0);
    table
        .invoke_current(&connect_call(), || Ok::<_, io::Error>(()))
        .unwrap();
    // Outside any interceptor the file write is observed normally.
    table
        .invoke_current(&log_write_call(), || Ok::<_, io::Error>(()))
        .unwrap();
    let types: Vec<EventType> = buffer.pending().iter().map(|e| e.event_type).collect();
    assert_eq!(types, vec![EventType::SocketConnect, EventType::FileWrite]);
    assert!(ExecutionContext::with_current(|ctx| ctx.is_safe_to_continue()));
}

#[test]
fn held_guard_skips_hooks_on_that_context_only() {
    let buffer = buffer();
    let mut registry = registry(&buffer);
    let table = HookTable::with_builtin_types();
    registry
        .register_sensor(FileSensor::build(&SensorOptions::new()).unwrap(), &table)
        .unwrap();

    let a = ExecutionContext::new(1);
    let b = ExecutionContext::new(2);
    let _held = a.try_enter().unwrap();
    assert!(!a.is_safe_to_continue());
    assert!(b.is_safe_to_continue());

    table.invoke(&a, &log_write_call(), || Ok::<_, io::Error>(())).unwrap();
    table.invoke(&b, &log_write_call(), || Ok::<_, io::Error>(())).unwrap();

    let events = buffer.pending();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].execution_context_id, 2);
}

#[test]
fn concurrent_threads_do_not_block_each_other() {
    let buffer = buffer();
    let mut registry = registry(&buffer);
    let table = Arc::new(HookTable::with_builtin_types());
    registry
        .register_sensor(FileSensor::build(&SensorOptions::new()).unwrap(), table.as_ref())
        .unwrap();

    let entered = Arc::new(Barrier::new(2));
    let done = Arc::new(Barrier::new(2));
    let holder = {
        let (entered, done) = (entered.clone(), done.clone());
        std::thread::spawn(move || {
            ExecutionContext::with_current(|ctx| {
                let _scope = ctx.try_enter().unwrap();
                entered.wait();
                done.wait();
            });
        })
    };
    entered.wait();
    table
        .invoke_current(&log_write_call(), || Ok::<_, io::Error>(()))
        .unwrap();
    done.wait();
    holder.join().unwrap();

    assert_eq!(buffer.len(), 1);
}

#[test]
fn scope_is_released_when_interceptor_panics() {
    struct Panicky;
    impl Interceptor for Panicky {
        fn on_entry(&self, _call: &Call) -> Result<Option<Capture>, InterceptorFault> {
            panic!("boom");
        }
    }

    let buffer = buffer();
    let mut registry = registry(&buffer);
    let table = HookTable::with_builtin_types();
    registry
        .register_sensor(
            Sensor::new("Panicky", "panicky").with_transform(Transform::new(
                TargetOperation::new("std::fs", "write"),
                Arc::new(Panicky),
            )),
            &table,
        )
        .unwrap();
    let hooks = registry.hooks_for(&TargetOperation::new("std::fs", "write"));
    let ctx = ExecutionContext::new(9);

    let result = hooks[0].on_entry(&ctx, &log_write_call());
    assert!(matches!(result, HookResult::Fault(InterceptorFault::Panicked(ref m)) if m == "boom"));
    assert!(ctx.is_safe_to_continue());
    assert!(buffer.is_empty());
}

#[test]
fn mismatched_exit_is_tolerated() {
    let ctx = ExecutionContext::new(3);
    ctx.exit();
    assert!(ctx.is_safe_to_continue());
    ctx.enter();
    ctx.enter();
    assert!(!ctx.is_safe_to_continue());
    ctx.exit();
    assert!(ctx.is_safe_to_continue());
}

#[test]
fn stale_guard_expires_when_configured() {
    let ctx = ExecutionContext::new(4).with_stale_after(Duration::from_millis(20));
    ctx.enter();
    assert!(!ctx.is_safe_to_continue());
    std::thread::sleep(Duration::from_millis(30));
    assert!(ctx.is_safe_to_continue());

    let strict = ExecutionContext::new(5);
    strict.enter();
    std::thread::sleep(Duration::from_millis(30));
    assert!(!strict.is_safe_to_continue());
}
