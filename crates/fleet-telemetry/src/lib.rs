//! Observability for the fleet worker.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`
//! - **Metrics**: labelled counters, gauges and run-duration histograms with
//!   Prometheus text export

pub mod logging;
pub mod metrics;
