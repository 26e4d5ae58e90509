//! External collaborator interfaces.
//!
//! The core never performs a fetch, writes a record, stamps a signature or
//! emits a metric directly - it calls out through these narrow traits so a
//! deployment can swap in browser automation, object storage, a captcha
//! solver, or a telemetry backend without the core depending on any of it.
//! The core must run correctly against trivial mock implementations of all
//! four.

use async_trait::async_trait;
use harvest_common::model::{Request, ResultRecord};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink rejected record: {0}")]
    Rejected(String),
}

/// Executes one request, optionally through a selected proxy.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request, proxy: Option<&str>) -> ResultRecord;
}

/// Accepts validated records for a job. Must be idempotent on
/// `(job_id, request_id, attempt)` to tolerate at-least-once delivery.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn write(&self, job_id: &str, record: &ResultRecord) -> Result<(), SinkError>;
}

/// Pure transform stamping additional headers/params onto a request before
/// it is dispatched (e.g. an auth token, a forged client hint).
pub trait SignatureProvider: Send + Sync {
    fn stamp(&self, request: Request) -> Request;
}

/// Receives named counters/gauges from the core. The default
/// implementation forwards to the `metrics` facade (see `harvest-common::metrics`);
/// this trait exists so a caller can redirect or suppress emission entirely.
pub trait MetricsEmitter: Send + Sync {
    fn increment_counter(&self, name: &'static str, value: u64);
    fn record_gauge(&self, name: &'static str, value: f64);
}

/// Forwards directly to the global `metrics` recorder.
pub struct GlobalMetricsEmitter;

impl MetricsEmitter for GlobalMetricsEmitter {
    fn increment_counter(&self, name: &'static str, value: u64) {
        metrics::counter!(name, value);
    }

    fn record_gauge(&self, name: &'static str, value: f64) {
        metrics::gauge!(name, value);
    }
}

/// A no-op signature provider, used where no stamping is configured.
pub struct IdentitySignatureProvider;

impl SignatureProvider for IdentitySignatureProvider {
    fn stamp(&self, request: Request) -> Request {
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_common::model::{HttpMethod, NewRequest};

    #[test]
    fn identity_signature_provider_is_a_no_op() {
        let req = Request::new(NewRequest {
            url: "https://example.com".to_owned(),
            method: HttpMethod::GET,
            ..Default::default()
        })
        .unwrap();
        let id = req.id;
        let stamped = IdentitySignatureProvider.stamp(req);
        assert_eq!(stamped.id, id);
    }
}
