//! In-process instrumentation capability.
//!
//! The host (or a test) routes its sensitive operations through
//! [`HookTable::invoke`], which fires installed entry hooks, runs the real
//! operation, then fires exit hooks. The operation's result, including its
//! error, is returned untouched.

use super::{InstalledHook, InstrumentationCapability};
use crate::guard::ExecutionContext;
use crate::sensors::{Call, CallOutcome, TargetOperation};
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::sync::{Arc, PoisonError, RwLock};

pub struct HookTable {
    /// Types present on this platform; targets on other types do not resolve
    available: HashSet<String>,
    hooks: RwLock<HashMap<TargetOperation, Vec<Arc<InstalledHook>>>>,
}

impl HookTable {
    pub fn new<I, S>(available_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            available: available_types.into_iter().map(Into::into).collect(),
            hooks: RwLock::new(HashMap::new()),
        }
    }

    /// Every type the built-in sensors target.
    pub fn with_builtin_types() -> Self {
        Self::new([
            "std::fs",
            "std::fs::File",
            "std::net::TcpStream",
            "std::net::TcpListener",
            "loader::ClassLoader",
            "loader::UrlClassLoader",
            "runtime::System",
            "std::env",
            "security::AccessController",
        ])
    }

    fn hooks(&self, target: &TargetOperation) -> Vec<Arc<InstalledHook>> {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
            .cloned()
            .unwrap_or_default()
    }

    pub fn installed(&self) -> usize {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Run `op` as an instrumented call on `ctx`.
    pub fn invoke<T, E, F>(&self, ctx: &ExecutionContext, call: &Call, op: F) -> Result<T, E>
    where
        E: Display,
        F: FnOnce() -> Result<T, E>,
    {
        self.invoke_with(ctx, call, op, |_| None)
    }

    /// Like [`invoke`](Self::invoke), describing the return value to exit hooks.
    pub fn invoke_with<T, E, F, D>(
        &self,
        ctx: &ExecutionContext,
        call: &Call,
        op: F,
        describe: D,
    ) -> Result<T, E>
    where
        E: Display,
        F: FnOnce() -> Result<T, E>,
        D: FnOnce(&T) -> Option<String>,
    {
        let hooks = self.hooks(&call.target);
        for hook in &hooks {
            hook.on_entry(ctx, call);
        }
        let result = op();
        if !hooks.is_empty() {
            match &result {
                Ok(value) => {
                    let desc = describe(value);
                    let outcome = CallOutcome::Returned(desc.as_deref());
                    for hook in &hooks {
                        hook.on_exit(ctx, call, &outcome);
                    }
                }
                Err(e) => {
                    let msg = e.to_string();
                    let outcome = CallOutcome::Failed(&msg);
                    for hook in &hooks {
                        hook.on_exit(ctx, call, &outcome);
                    }
                }
            }
        }
        result
    }

    /// [`invoke`](Self::invoke) on the calling thread's context.
    pub fn invoke_current<T, E, F>(&self, call: &Call, op: F) -> Result<T, E>
    where
        E: Display,
        F: FnOnce() -> Result<T, E>,
    {
        ExecutionContext::with_current(|ctx| self.invoke(ctx, call, op))
    }
}

impl InstrumentationCapability for HookTable {
    fn resolve(&self, target: &TargetOperation) -> Option<TargetOperation> {
        self.available
            .contains(&target.type_name)
            .then(|| target.clone())
    }

    fn install_transform(&self, target: &TargetOperation, hook: Arc<InstalledHook>) {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(target.clone())
            .or_default()
            .push(hook);
    }
}
