//! Extension points of a pipeline run.
//!
//! Observers are called synchronously, in registration order, on the thread
//! running the pipeline. They see the events but cannot alter the image.

use std::sync::Arc;

use data_model::MimeType;
use opentelemetry::KeyValue;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    TransformationsStarted {
        owner: String,
        identifier: String,
        transformations: Vec<String>,
    },
    TransformationApplied {
        name: String,
        width: u32,
        height: u32,
    },
    /// Content negotiation added a conversion the client did not ask for.
    ConversionAppended { from: MimeType, to: MimeType },
    TransformationsFinished {
        mime_type: MimeType,
        width: u32,
        height: u32,
        modified: bool,
    },
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::TransformationsStarted { .. } => "transformations.started",
            PipelineEvent::TransformationApplied { .. } => "transformation.applied",
            PipelineEvent::ConversionAppended { .. } => "conversion.appended",
            PipelineEvent::TransformationsFinished { .. } => "transformations.finished",
        }
    }
}

pub trait PipelineObserver: Send + Sync {
    fn notify(&self, event: &PipelineEvent);
}

/// Logs every event.
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn notify(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::ConversionAppended { from, to } => {
                info!(%from, %to, "appending conversion for content negotiation");
            }
            other => debug!(event = other.name(), ?other, "pipeline event"),
        }
    }
}

/// Counts applied transformations and conversions.
pub struct MetricsObserver {
    metrics: Arc<metrics::pipeline::Metrics>,
}

impl MetricsObserver {
    pub fn new(metrics: Arc<metrics::pipeline::Metrics>) -> Self {
        Self { metrics }
    }
}

impl PipelineObserver for MetricsObserver {
    fn notify(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::TransformationApplied { name, .. } => self
                .metrics
                .transformations_applied
                .add(1, &[KeyValue::new("transformation", name.clone())]),
            PipelineEvent::ConversionAppended { to, .. } => self
                .metrics
                .conversions
                .add(1, &[KeyValue::new("mime_type", to.as_ref().to_string())]),
            _ => {}
        }
    }
}
