use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::{metrics::Histogram, KeyValue};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0,
    ]
}

/// Installs the global OTLP meter provider. Meters created before this call,
/// or when metrics are disabled, record into the no-op provider.
pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    instance_id: Option<&String>,
    service_version: &str,
) -> Result<()> {
    if !enable_metrics {
        return Ok(());
    }

    let mut resource_builder = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "imagehost"))
        .with_attribute(KeyValue::new("service.name", "imagehost-server"))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ));

    if let Some(instance_id) = instance_id {
        resource_builder = resource_builder.with_attribute(KeyValue::new(
            "imagehost.instance.id",
            instance_id.to_owned(),
        ));
    }

    let resource = resource_builder.build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider);
    Ok(())
}

pub mod api_io_stats {
    use opentelemetry::metrics::Counter;

    #[derive(Debug)]
    pub struct Metrics {
        pub images_stored: Counter<u64>,
        pub bytes_stored: Counter<u64>,
        pub images_deleted: Counter<u64>,
        pub images_served: Counter<u64>,
        pub bytes_served: Counter<u64>,
        pub not_modified: Counter<u64>,
        pub auth_failures: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("service-api");
            let images_stored = meter
                .u64_counter("imagehost.images_stored")
                .with_description("number of images stored")
                .build();
            let bytes_stored = meter
                .u64_counter("imagehost.bytes_stored")
                .with_description("number of image bytes ingested")
                .build();
            let images_deleted = meter
                .u64_counter("imagehost.images_deleted")
                .with_description("number of images deleted")
                .build();
            let images_served = meter
                .u64_counter("imagehost.images_served")
                .with_description("number of image bodies served")
                .build();
            let bytes_served = meter
                .u64_counter("imagehost.bytes_served")
                .with_description("number of image bytes served")
                .build();
            let not_modified = meter
                .u64_counter("imagehost.not_modified")
                .with_description("number of conditional requests answered with 304")
                .build();
            let auth_failures = meter
                .u64_counter("imagehost.auth_failures")
                .with_description("number of rejected signed requests")
                .build();
            Metrics {
                images_stored,
                bytes_stored,
                images_deleted,
                images_served,
                bytes_served,
                not_modified,
                auth_failures,
            }
        }
    }
}

pub mod pipeline {
    use opentelemetry::metrics::{Counter, Histogram};

    use crate::low_latency_boundaries;

    #[derive(Debug)]
    pub struct Metrics {
        pub runs: Histogram<f64>,
        pub transformations_applied: Counter<u64>,
        pub conversions: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("transformation-pipeline");

            let runs = meter
                .f64_histogram("imagehost.pipeline_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("transformation pipeline latencies in seconds")
                .build();

            let transformations_applied = meter
                .u64_counter("imagehost.transformations_applied")
                .with_description("number of transformations applied, by name")
                .build();

            let conversions = meter
                .u64_counter("imagehost.conversions")
                .with_description("number of format conversions, by target type")
                .build();

            Metrics {
                runs,
                transformations_applied,
                conversions,
            }
        }
    }
}

pub mod blob_storage {
    use opentelemetry::metrics::Histogram;

    use crate::low_latency_boundaries;

    #[derive(Debug)]
    pub struct Metrics {
        pub operations: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("blob-storage");

            let operations = meter
                .f64_histogram("imagehost.blob_operations_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("blob store latencies in seconds")
                .build();

            Metrics { operations }
        }
    }
}

pub mod metadata_storage {
    use opentelemetry::metrics::{Counter, Histogram};

    use crate::low_latency_boundaries;

    #[derive(Debug)]
    pub struct Metrics {
        pub reads: Histogram<f64>,
        pub writes: Histogram<f64>,
        pub compensations: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("metadata-storage");

            let reads = meter
                .f64_histogram("imagehost.metadata_read_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("metadata store read latencies in seconds")
                .build();

            let writes = meter
                .f64_histogram("imagehost.metadata_write_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("metadata store write latencies in seconds")
                .build();

            let compensations = meter
                .u64_counter("imagehost.store_compensations")
                .with_description("metadata rows rolled back after a failed blob write")
                .build();

            Metrics {
                reads,
                writes,
                compensations,
            }
        }
    }
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records the time between construction and drop.
pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start_with_labels(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }
}

impl<T: TimerUpdate + Sync> Drop for Timer<'_, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), self.labels);
    }
}
