use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "feedline_feed_cache_hit_total",
            Unit::Count,
            "Feed pages whose window was already cached."
        );
        describe_counter!(
            "feedline_feed_cache_miss_total",
            Unit::Count,
            "Feed reads that had to materialize the window from the store."
        );
        describe_counter!(
            "feedline_feed_store_fallback_total",
            Unit::Count,
            "Feed pages read directly from the feed entry store."
        );
        describe_counter!(
            "feedline_fanout_batches_enqueued_total",
            Unit::Count,
            "Fan-out batch jobs enqueued by the coordinator."
        );
        describe_counter!(
            "feedline_fanout_entries_inserted_total",
            Unit::Count,
            "Feed entries newly written by fan-out."
        );
        describe_counter!(
            "feedline_fanout_cache_push_failures_total",
            Unit::Count,
            "Feed window pushes that failed and were left for lazy repair."
        );
        describe_histogram!(
            "feedline_fanout_batch_ms",
            Unit::Milliseconds,
            "Latency of one fan-out batch in milliseconds."
        );
    });
}
