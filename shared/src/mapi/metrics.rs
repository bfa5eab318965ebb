use log::{info, warn};
use warp::{Filter, Rejection, Reply};

/// Renders every metric in the default registry: the suite's own series
/// (MachineSet replica gauges, health check remediation counters) plus
/// the process metrics prometheus registers by itself.
async fn metrics_handler() -> Result<impl Reply, Rejection> {
    let encoder = prometheus::TextEncoder::new();
    match encoder.encode_to_string(&prometheus::gather()) {
        Ok(body) => Ok(body),
        Err(e) => {
            warn!("failed to encode prometheus metrics: {}", e);
            Err(warp::reject::reject())
        }
    }
}

/// Serves the Prometheus scrape endpoint at /metrics. The port comes from
/// the controller configuration; this never returns while the server is
/// healthy.
pub async fn run_metrics_server(port: u16) {
    info!("starting metrics server on port {} at /metrics", port);
    let metrics_route = warp::path!("metrics").and_then(metrics_handler);
    warp::serve(metrics_route).run(([0, 0, 0, 0], port)).await;
}
