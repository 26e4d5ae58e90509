//! Health reporting for background loops of the crawl substrate.
//!
//! The Coordinator runs several independent cooperative loops (reclamation,
//! snapshotting, feedback ticking). `HealthRegistry` lets an arbitrary
//! number of them report their health; the process' health status is the
//! combination of these individual statuses:
//!   - if any component is unhealthy, the process is unhealthy
//!   - if all components recently reported healthy, the process is healthy
//!   - if a component failed to report healthy for its defined deadline,
//!     it is considered unhealthy, and the check fails.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status: true if all components are healthy.
    pub healthy: bool,
    /// Current status of each registered component, for display.
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered.
    Starting,
    /// Recently reported healthy, will need to report again before the date.
    HealthyUntil(time::OffsetDateTime),
    /// Reported unhealthy.
    Unhealthy,
    /// Automatically set when the HealthyUntil deadline is reached.
    Stalled,
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    /// Asynchronously report healthy, returns when the message is queued.
    /// Must be called more frequently than the configured deadline.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ))
        .await
    }

    /// Asynchronously report component status, returns when the message is queued.
    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {}", err)
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(16);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Ok(mut map) = components.write() {
                    _ = map.insert(message.component, message.status);
                } else {
                    warn!("poisoned HealthRegistry mutex")
                }
            }
        });

        registry
    }

    /// Registers a new component in the registry. The returned handle should
    /// be passed to the component, so it can frequently report its status.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Returns the overall process status, computed from the status of all
    /// components currently registered. Usable directly as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .expect("poisoned HealthRegistry mutex");

        let result = HealthStatus {
            healthy: !components.is_empty(),
            components: Default::default(),
        };
        let now = time::OffsetDateTime::now_utc();

        let result = components.iter().fold(result, |mut result, (name, status)| {
            match status {
                ComponentStatus::HealthyUntil(until) => {
                    if until.gt(&now) {
                        _ = result.components.insert(name.clone(), status.clone())
                    } else {
                        result.healthy = false;
                        _ = result
                            .components
                            .insert(name.clone(), ComponentStatus::Stalled)
                    }
                }
                _ => {
                    result.healthy = false;
                    _ = result.components.insert(name.clone(), status.clone())
                }
            }
            result
        });
        match result.healthy {
            true => info!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }
        result
    }
}
