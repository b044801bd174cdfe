//! Prometheus metrics HTTP endpoint
//!
//! Exposes evaluator metrics in Prometheus text format at /metrics and a
//! liveness probe at /health. Uses hyper for the HTTP server.
//!
//! Scrapes read a snapshot; they never reset the periodic log window.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name} {val}");
}

/// Counter with one value per label, e.g. evaluation outcomes
fn write_labeled_counter(
    output: &mut String,
    name: &str,
    help: &str,
    label: &str,
    values: &[(&str, u64)],
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    for (value, count) in values {
        let _ = writeln!(output, "{name}{{{label}=\"{value}\"}} {count}");
    }
}

/// Write a cumulative histogram with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_sum {sum}");
    let _ = writeln!(output, "{name}_count {cumulative}");
}

/// Format metrics in Prometheus text exposition format
pub fn format_prometheus_metrics(metrics: &Metrics) -> String {
    let summary = metrics.snapshot();
    let mut output = String::with_capacity(4096);

    write_presence_metrics(&mut output, &summary);
    write_evaluation_metrics(&mut output, &summary);
    write_notification_metrics(&mut output, &summary);

    output
}

fn write_presence_metrics(output: &mut String, summary: &MetricsSummary) {
    write_metric(
        output,
        "geofence_presence_received_total",
        "Presence updates received",
        MetricType::Counter,
        summary.presence_received,
    );
    write_metric(
        output,
        "geofence_presence_dropped_total",
        "Presence updates dropped because the worker queue was full",
        MetricType::Counter,
        summary.presence_dropped,
    );
    write_metric(
        output,
        "geofence_presence_invalid_total",
        "Presence publishes that could not be parsed",
        MetricType::Counter,
        summary.presence_invalid,
    );
    write_metric(
        output,
        "geofence_presence_superseded_total",
        "Queued presence snapshots replaced by a newer snapshot for the same site",
        MetricType::Counter,
        summary.presence_superseded,
    );
    write_metric(
        output,
        "geofence_queue_delay_max_us",
        "Maximum presence queue delay in the current window",
        MetricType::Gauge,
        summary.queue_delay_max_us,
    );
}

fn write_evaluation_metrics(output: &mut String, summary: &MetricsSummary) {
    write_metric(
        output,
        "geofence_evaluations_total",
        "Geofence evaluations completed, including failures",
        MetricType::Counter,
        summary.evaluations_total,
    );
    write_labeled_counter(
        output,
        "geofence_evaluation_outcomes_total",
        "Evaluation outcomes",
        "outcome",
        &[
            ("skipped", summary.skipped_total),
            ("no_action", summary.no_action_total),
            ("auto_armed", summary.auto_arms_total),
            ("arm_prompted", summary.arm_prompts_total),
            ("disarm_prompted", summary.disarm_prompts_total),
            ("failed", summary.evaluation_failures_total),
        ],
    );
    write_metric(
        output,
        "geofence_partitions_armed_total",
        "Partitions moved from disarmed to armed",
        MetricType::Counter,
        summary.partitions_armed_total,
    );
    write_metric(
        output,
        "geofence_evaluation_retries_total",
        "Evaluation attempts retried after a store failure",
        MetricType::Counter,
        summary.evaluation_retries_total,
    );
    write_histogram(
        output,
        "geofence_evaluation_latency_us",
        "Evaluation latency including retries, in microseconds",
        &summary.lat_buckets_total,
        summary.lat_sum_total_us,
    );
}

fn write_notification_metrics(output: &mut String, summary: &MetricsSummary) {
    write_metric(
        output,
        "geofence_notifications_dispatched_total",
        "Prompt notifications queued for delivery",
        MetricType::Counter,
        summary.notifications_dispatched,
    );
    write_metric(
        output,
        "geofence_notifications_dropped_total",
        "Prompt notifications dropped before delivery",
        MetricType::Counter,
        summary.notifications_dropped,
    );
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let mut response = text_response(StatusCode::OK, format_prometheus_metrics(&metrics));
            response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT));
            response
        }
        (&Method::GET, "/health") => text_response(StatusCode::OK, "ok"),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };
    Ok(response)
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = %port, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
