use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::time::Duration;
use tokio::runtime;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Health reporting for components of the service.
///
/// The archiver contains several asynchronous loops, and the process can
/// only be trusted with records if all of them are running and making
/// progress. HealthRegistry lets an arbitrary number of components register
/// and report two things:
///   - liveness: "I am still running", refreshed against a deadline
///   - progress: "I successfully handled a record", checked against an
///     optional staleness window
///
/// The process status is derived from the worst component status:
///   - a component that reported unhealthy, never reported, or whose
///     liveness deadline passed makes the process unhealthy
///   - a live component with a staleness window that has seen no progress
///     inside that window makes the process degraded
///   - otherwise the process is healthy

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status: the worst status across all components.
    /// None until at least one component has registered.
    pub status: Option<Status>,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentStatus>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == Some(Status::Healthy)
    }
}

impl IntoResponse for HealthStatus {
    /// Computes the status code from the overall health status, and prints
    /// each component status in the body for debugging. Degraded still
    /// returns 200: the pipeline is serving, just lagging.
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.status {
            Some(Status::Healthy) | Some(Status::Degraded) => (StatusCode::OK, body),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered
    Starting,
    /// Recently reported alive, will need to report again before the
    /// deadline; carries the last time the component reported progress
    Alive {
        until: time::OffsetDateTime,
        last_progress: time::OffsetDateTime,
    },
    /// Reported unhealthy
    Unhealthy,
    /// Automatically set when the liveness deadline is reached
    Stalled,
}

enum HealthMessage {
    Alive {
        component: String,
        until: time::OffsetDateTime,
    },
    Progress {
        component: String,
        at: time::OffsetDateTime,
    },
    Down {
        component: String,
    },
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    /// Asynchronously report alive, returns when the message is queued.
    /// Must be called more frequently than the configured deadline.
    pub async fn report_alive(&self) {
        self.send(HealthMessage::Alive {
            component: self.component.clone(),
            until: time::OffsetDateTime::now_utc().add(self.deadline),
        })
        .await
    }

    /// Asynchronously report that a record was successfully handled.
    /// Feeds the staleness derivation.
    pub async fn report_progress(&self) {
        self.send(HealthMessage::Progress {
            component: self.component.clone(),
            at: time::OffsetDateTime::now_utc(),
        })
        .await
    }

    /// Asynchronously report unhealthy, returns when the message is queued.
    pub async fn report_unhealthy(&self) {
        self.send(HealthMessage::Down {
            component: self.component.clone(),
        })
        .await
    }

    /// Synchronously report as alive, for callers outside an async context
    /// (e.g. librdkafka callbacks).
    pub fn report_alive_blocking(&self) {
        let message = HealthMessage::Alive {
            component: self.component.clone(),
            until: time::OffsetDateTime::now_utc().add(self.deadline),
        };
        // Don't panic if we're called from within an async context,
        // just spawn instead
        if let Ok(h) = runtime::Handle::try_current() {
            let sender = self.sender.clone();
            h.spawn(async move {
                if let Err(err) = sender.send(message).await {
                    warn!("failed to report health status: {}", err)
                }
            });
        } else if let Err(err) = self.sender.blocking_send(message) {
            warn!("failed to report health status: {}", err)
        }
    }

    async fn send(&self, message: HealthMessage) {
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {}", err)
        }
    }
}

struct Component {
    status: ComponentStatus,
    /// None disables the staleness derivation for this component
    staleness_window: Option<Duration>,
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, Component>>>,
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
                let Ok(mut map) = components.write() else {
                    // Poisoned mutex: just warn, the probes will fail and the process restart
                    warn!("poisoned HealthRegistry mutex");
                    continue;
                };
                match message {
                    HealthMessage::Alive { component, until } => {
                        if let Some(entry) = map.get_mut(&component) {
                            let last_progress = match entry.status {
                                ComponentStatus::Alive { last_progress, .. } => last_progress,
                                // The first liveness report is the progress baseline,
                                // so an idle pipeline only degrades once the window elapses
                                _ => time::OffsetDateTime::now_utc(),
                            };
                            entry.status = ComponentStatus::Alive {
                                until,
                                last_progress,
                            };
                        }
                    }
                    HealthMessage::Progress { component, at } => {
                        if let Some(entry) = map.get_mut(&component) {
                            let until = match entry.status {
                                ComponentStatus::Alive { until, .. } => until,
                                _ => at,
                            };
                            entry.status = ComponentStatus::Alive {
                                until,
                                last_progress: at,
                            };
                        }
                    }
                    HealthMessage::Down { component } => {
                        if let Some(entry) = map.get_mut(&component) {
                            entry.status = ComponentStatus::Unhealthy;
                        }
                    }
                }
            }
        });

        registry
    }

    /// Registers a new component. The returned handle should be passed to
    /// the component, to let it report liveness and progress. A component
    /// registered with a staleness window degrades the process when it has
    /// not reported progress within that window.
    pub async fn register(
        &self,
        component: String,
        deadline: Duration,
        staleness_window: Option<Duration>,
    ) -> HealthHandle {
        if let Ok(mut map) = self.components.write() {
            map.insert(
                component.clone(),
                Component {
                    status: ComponentStatus::Starting,
                    staleness_window,
                },
            );
        }
        HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        }
    }

    /// Returns the overall process status, computed from the status of all
    /// the components currently registered. Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .expect("poisoned HealthRegistry mutex");

        let now = time::OffsetDateTime::now_utc();
        let mut result = HealthStatus {
            status: None,
            components: Default::default(),
        };

        for (name, component) in components.iter() {
            let (derived, display) = match &component.status {
                ComponentStatus::Alive {
                    until,
                    last_progress,
                } if until.gt(&now) => {
                    let stale = component
                        .staleness_window
                        .map(|window| last_progress.add(window).lt(&now))
                        .unwrap_or(false);
                    let derived = if stale {
                        Status::Degraded
                    } else {
                        Status::Healthy
                    };
                    (derived, component.status.clone())
                }
                ComponentStatus::Alive { .. } => (Status::Unhealthy, ComponentStatus::Stalled),
                other => (Status::Unhealthy, other.clone()),
            };
            result.status = Some(result.status.map_or(derived, |s| s.max(derived)));
            result.components.insert(name.clone(), display);
        }

        match result.status {
            Some(Status::Healthy) => info!("{} health check ok", self.name),
            Some(Status::Degraded) => warn!(
                "{} health check degraded: {:?}",
                self.name, result.components
            ),
            _ => warn!(
                "{} health check failed: {:?}",
                self.name, result.components
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use crate::{ComponentStatus, HealthRegistry, HealthStatus, Status};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use std::ops::Add;
    use std::time::Duration;
    use time::OffsetDateTime;

    async fn assert_or_retry<F>(check: F)
    where
        F: Fn() -> bool,
    {
        assert_or_retry_for_duration(check, Duration::from_secs(5)).await
    }

    async fn assert_or_retry_for_duration<F>(check: F, timeout: Duration)
    where
        F: Fn() -> bool,
    {
        let deadline = OffsetDateTime::now_utc().add(timeout);
        while !check() && OffsetDateTime::now_utc().lt(&deadline) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(check())
    }

    #[tokio::test]
    async fn defaults_to_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().is_healthy());
    }

    #[tokio::test]
    async fn one_component() {
        let registry = HealthRegistry::new("liveness");

        // New components are registered in Starting
        let handle = registry
            .register("worker".to_string(), Duration::from_secs(30), None)
            .await;
        let status = registry.get_status();
        assert_eq!(status.status, Some(Status::Unhealthy));
        assert_eq!(
            status.components.get("worker"),
            Some(&ComponentStatus::Starting)
        );

        // Status goes healthy once the component reports
        handle.report_alive().await;
        assert_or_retry(|| registry.get_status().is_healthy()).await;

        // Status goes unhealthy if the component says so
        handle.report_unhealthy().await;
        assert_or_retry(|| registry.get_status().status == Some(Status::Unhealthy)).await;
        let status = registry.get_status();
        assert_eq!(
            status.components.get("worker"),
            Some(&ComponentStatus::Unhealthy)
        );
    }

    #[tokio::test]
    async fn stalled_liveness_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("worker".to_string(), Duration::from_millis(10), None)
            .await;

        handle.report_alive().await;
        assert_or_retry(|| registry.get_status().is_healthy()).await;

        // Once the deadline passes without a report, the component stalls
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = registry.get_status();
        assert_eq!(status.status, Some(Status::Unhealthy));
        assert_eq!(
            status.components.get("worker"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[tokio::test]
    async fn stale_progress_is_degraded() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register(
                "worker".to_string(),
                Duration::from_secs(30),
                Some(Duration::from_millis(20)),
            )
            .await;

        handle.report_alive().await;
        handle.report_progress().await;
        assert_or_retry(|| registry.get_status().is_healthy()).await;

        // Still alive, but no progress inside the window: degraded, not unhealthy
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.report_alive().await;
        assert_or_retry(|| registry.get_status().status == Some(Status::Degraded)).await;

        // Progress brings it back to healthy
        handle.report_progress().await;
        assert_or_retry(|| registry.get_status().is_healthy()).await;
    }

    #[tokio::test]
    async fn several_components_worst_wins() {
        let registry = HealthRegistry::new("liveness");
        let handle1 = registry
            .register(
                "one".to_string(),
                Duration::from_secs(30),
                Some(Duration::from_millis(20)),
            )
            .await;
        let handle2 = registry
            .register("two".to_string(), Duration::from_secs(30), None)
            .await;

        handle1.report_alive().await;
        handle2.report_alive().await;
        assert_or_retry(|| registry.get_status().is_healthy()).await;

        // One component going stale degrades the process
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle1.report_alive().await;
        assert_or_retry(|| registry.get_status().status == Some(Status::Degraded)).await;

        // The other going down beats degraded
        handle2.report_unhealthy().await;
        assert_or_retry(|| registry.get_status().status == Some(Status::Unhealthy)).await;
    }

    #[tokio::test]
    async fn into_response() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = HealthStatus {
            status: Some(Status::Healthy),
            components: Default::default(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);

        // Degraded keeps serving traffic
        let degraded = HealthStatus {
            status: Some(Status::Degraded),
            components: Default::default(),
        }
        .into_response();
        assert_eq!(degraded.status(), StatusCode::OK);
    }
}
