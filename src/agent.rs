//! Monitored-process side assembly: buffer, dispatcher, event factory and
//! registry are built once here and handed to whoever needs them.

use crate::config::{AgentConfig, PipelineConfig};
use crate::error::ConfigurationError;
use crate::event::EventFactory;
use crate::instrument::{
    CaptureRuntime, InstrumentationCapability, InterceptorRegistry, RegistrationReport,
};
use crate::pipeline::{Dispatcher, EventBuffer, EventSink, StatsSnapshot};
use crate::sensors::{self, Sensor};
use std::sync::Arc;
use tracing::{info, warn};

pub struct Agent {
    registry: InterceptorRegistry,
    runtime: Arc<CaptureRuntime>,
    dispatcher: Dispatcher,
}

impl Agent {
    /// Start the pipeline and register every built-in sensor. A sensor whose
    /// options are invalid is skipped; the rest keep running.
    pub fn start(
        config: &AgentConfig,
        sink: Box<dyn EventSink>,
        capability: &dyn InstrumentationCapability,
    ) -> Result<Self, ConfigurationError> {
        let mut agent = Self::with_pipeline(config.pipeline()?, EventFactory::for_process(), sink)?;
        for sensor in sensors::builtin(&config.options) {
            match sensor {
                Ok(sensor) => {
                    if let Err(e) = agent.register_sensor(sensor, capability) {
                        warn!(error = %e, "sensor registration failed");
                    }
                }
                Err(e) => warn!(error = %e, "sensor disabled by configuration error"),
            }
        }
        Ok(agent)
    }

    /// Pipeline only, no sensors registered.
    pub fn with_pipeline(
        pipeline: PipelineConfig,
        factory: EventFactory,
        sink: Box<dyn EventSink>,
    ) -> Result<Self, ConfigurationError> {
        let buffer = Arc::new(EventBuffer::new(
            pipeline.capacity,
            pipeline.overflow,
            pipeline.wait_timeout,
        ));
        let dispatcher = Dispatcher::spawn(buffer.clone(), sink, &pipeline)
            .map_err(|e| ConfigurationError::Startup(e.to_string()))?;
        info!(
            origin = %factory.origin(),
            capacity = pipeline.capacity,
            overflow = ?pipeline.overflow,
            "agent pipeline started"
        );
        let runtime = Arc::new(CaptureRuntime::new(factory, buffer));
        Ok(Self {
            registry: InterceptorRegistry::new(runtime.clone()),
            runtime,
            dispatcher,
        })
    }

    pub fn register_sensor(
        &mut self,
        sensor: Sensor,
        capability: &dyn InstrumentationCapability,
    ) -> Result<RegistrationReport, ConfigurationError> {
        self.registry.register_sensor(sensor, capability)
    }

    pub fn registry(&self) -> &InterceptorRegistry {
        &self.registry
    }

    pub fn buffer(&self) -> &Arc<EventBuffer> {
        self.runtime.buffer()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.runtime.buffer().stats().snapshot()
    }

    /// Bounded-time flush, then stop. Returns the final counters.
    pub fn shutdown(self) -> StatsSnapshot {
        let stats = self.dispatcher.shutdown();
        info!(
            dispatched = stats.dispatched,
            lost = stats.total_loss(),
            "agent stopped"
        );
        stats
    }
}
