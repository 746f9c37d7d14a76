//! recflow-proc library interface
//!
//! Processing engine, job queue and scheduler, matching, services and the harvest
//! boundary. The binary wires them together; integration tests use them directly.

pub mod db;
pub mod engine;
pub mod harvest;
pub mod matching;
pub mod models;
pub mod queue;
pub mod scheduler;
pub mod services;

use recflow_common::config::RecflowConfig;
use recflow_common::events::EventBus;
use recflow_common::index::{NullIndex, SearchIndex};
use recflow_common::Result;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::engine::{LogReportSink, PipelineEngine, ReportSink};
use crate::models::ServiceInfo;
use crate::queue::JobQueue;
use crate::services::{MetadataService, ServiceContext, ServiceRegistry};

/// Shared handles for the engine, scheduler and lifecycle operations
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub event_bus: EventBus,
    pub index: Arc<dyn SearchIndex>,
    pub config: Arc<RecflowConfig>,
    pub registry: Arc<ServiceRegistry>,
    pub reports: Arc<dyn ReportSink>,
}

impl AppState {
    pub fn new(db: SqlitePool, event_bus: EventBus, config: RecflowConfig) -> Self {
        Self {
            db,
            event_bus,
            index: Arc::new(NullIndex),
            config: Arc::new(config),
            registry: Arc::new(ServiceRegistry::with_builtin()),
            reports: Arc::new(LogReportSink),
        }
    }

    pub fn with_index(mut self, index: Arc<dyn SearchIndex>) -> Self {
        self.index = index;
        self
    }

    pub fn with_registry(mut self, registry: ServiceRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_report_sink(mut self, reports: Arc<dyn ReportSink>) -> Self {
        self.reports = reports;
        self
    }

    pub fn queue(&self) -> JobQueue {
        JobQueue::new(self.db.clone(), self.event_bus.clone())
            .with_max_lock_wait_ms(self.config.engine.max_lock_wait_ms)
    }

    pub fn engine(&self) -> PipelineEngine {
        PipelineEngine::new(
            self.db.clone(),
            self.index.clone(),
            self.event_bus.clone(),
            self.queue(),
            self.config.engine.clone(),
        )
        .with_report_sink(self.reports.clone())
    }

    pub fn service_context(&self, info: &ServiceInfo) -> ServiceContext {
        self.engine().service_context(info)
    }

    /// Fresh implementation instance for a service row
    pub fn instantiate(&self, info: &ServiceInfo) -> Result<Box<dyn MetadataService>> {
        self.registry.create(info, &self.config)
    }
}
