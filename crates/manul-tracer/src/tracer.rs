//! Ready-made tracer: an HTTP client, a traced transport and a write pipeline

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn};

use crate::collector::{Pipeline, PipelineStats, TraceSink};
use crate::config::{Config, TracerConfig};
use crate::db::SqliteStore;
use crate::error::Result;
use crate::models::{Session, SessionInfo, TransportStats, User};
use crate::transport::{
    ReqwestTransport, Request, Response, TracedTransport, TracerOptions, Transport,
    TransportError,
};

/// Traced transport together with the pipeline it writes to.
///
/// Use it wherever a [`Transport`] is expected; every call is traced into
/// the current session.
pub struct Tracer<T = ReqwestTransport> {
    transport: TracedTransport<T>,
    pipeline: Option<Arc<Pipeline>>,
    worker: Option<JoinHandle<()>>,
}

impl Tracer<ReqwestTransport> {
    /// HTTP tracer sending finished traces to `sink`
    pub fn new(config: &Config, sink: Arc<dyn TraceSink>) -> Result<Self> {
        let inner = ReqwestTransport::from_config(&config.http)?;
        Ok(Self::with_transport(inner, &config.tracer, sink))
    }

    /// HTTP tracer persisting into the configured database
    pub async fn open(config: &Config) -> Result<Self> {
        let inner = ReqwestTransport::from_config(&config.http)?;
        Self::open_with(config, inner).await
    }
}

impl<T: Transport + 'static> Tracer<T> {
    /// Trace calls made through `inner`, sending finished traces to `sink`
    pub fn with_transport(inner: T, config: &TracerConfig, sink: Arc<dyn TraceSink>) -> Self {
        Self {
            transport: TracedTransport::new(inner, options(config), sink),
            pipeline: None,
            worker: None,
        }
    }

    /// Trace calls made through `inner` into the configured database.
    ///
    /// Connects, applies migrations, registers the configured user and starts
    /// the write pipeline on the current runtime.
    pub async fn open_with(config: &Config, inner: T) -> Result<Self> {
        let store = SqliteStore::connect(&config.database).await?;
        store.migrate().await?;

        let mut options = options(&config.tracer);
        if config.tracer.has_identity() {
            let user = User::new(
                config.tracer.user_id.clone(),
                config.tracer.username.clone(),
                config.tracer.email.clone(),
            );
            store.upsert_user(&user).await?;
            options.user_id = Some(user.user_id);
        }

        let pipeline = Arc::new(Pipeline::new(&config.collector, store));
        let worker = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.start().await }
        });

        let sink: Arc<dyn TraceSink> = pipeline.clone();
        let transport = TracedTransport::new(inner, options, sink);
        info!(session_id = %transport.session_id(), "Tracer opened");

        Ok(Self {
            transport,
            pipeline: Some(pipeline),
            worker: Some(worker),
        })
    }

    /// The traced transport
    pub fn transport(&self) -> &TracedTransport<T> {
        &self.transport
    }

    /// The write pipeline, when the tracer owns one
    pub fn pipeline(&self) -> Option<&Pipeline> {
        self.pipeline.as_deref()
    }

    /// Statistics of the write pipeline
    pub fn pipeline_stats(&self) -> Option<PipelineStats> {
        self.pipeline.as_ref().map(|pipeline| pipeline.stats())
    }

    /// Current session id
    pub fn session_id(&self) -> String {
        self.transport.session_id()
    }

    /// Snapshot of the running counters
    pub fn stats(&self) -> TransportStats {
        self.transport.stats()
    }

    /// Zero the running counters
    pub fn reset_stats(&self) {
        self.transport.reset_stats();
    }

    /// Session details with the running counters
    pub fn session_info(&self) -> SessionInfo {
        self.transport.session_info()
    }

    /// Write everything traced so far
    pub async fn flush(&self) -> Result<()> {
        match &self.pipeline {
            Some(pipeline) => pipeline.flush().await,
            None => Ok(()),
        }
    }

    /// End the session, write everything queued and stop the pipeline
    pub async fn close(mut self) -> Result<Session> {
        let session = self.transport.end_session();

        if let Some(pipeline) = self.pipeline.take() {
            pipeline.shutdown().await?;
        }
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "Pipeline task ended abnormally");
            }
        }

        info!(session_id = %session.session_id, "Tracer closed");
        Ok(session)
    }
}

fn options(config: &TracerConfig) -> TracerOptions {
    let span = info_span!("manul_tracer");
    TracerOptions::from(config).with_span(span)
}

#[async_trait]
impl<T: Transport + 'static> Transport for Tracer<T> {
    async fn handle_request(
        &self,
        request: Request,
    ) -> std::result::Result<Response, TransportError> {
        self.transport.handle_request(request).await
    }
}
