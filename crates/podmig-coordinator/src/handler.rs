use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use podmig_common::{MigrationResult, PodDirectory};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{error, info, instrument, warn};

use crate::client::MigrationClient;
use crate::manager::{MigrationManager, ReadyMigration};
use crate::record::{MigrationState, RecordGuard};
use crate::CoordinatorError;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<MigrationManager>,
    pub client: Arc<MigrationClient>,
    pub pods: Arc<dyn PodDirectory>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl CoordinatorError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            CoordinatorError::PodNotFound(_) => (StatusCode::NOT_FOUND, "pod_not_found"),
            CoordinatorError::PodNotRunning { .. } => (StatusCode::CONFLICT, "pod_not_running"),
            CoordinatorError::UnknownContainer { .. } => (StatusCode::BAD_REQUEST, "unknown_container"),
            CoordinatorError::MigrationInProgress(_) => (StatusCode::CONFLICT, "migration_in_progress"),
            CoordinatorError::ReadyTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "ready_timeout"),
            CoordinatorError::CheckpointFailed(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "checkpoint_failed")
            }
            CoordinatorError::Trigger(e) => (e.status(), "trigger_failed"),
            CoordinatorError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for CoordinatorError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let body = ErrorBody {
            error: self.to_string(),
            code,
        };
        (status, Json(body)).into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/migrate/:pod_uid", get(migrate_handler))
        .route("/trigger/:namespace/:name", post(trigger_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct MigrateQuery {
    #[serde(default)]
    containers: Option<String>,
}

impl MigrateQuery {
    fn container_names(&self) -> Vec<String> {
        self.containers
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[instrument(skip(state, query))]
async fn migrate_handler(
    State(state): State<AppState>,
    Path(pod_uid): Path<String>,
    Query(query): Query<MigrateQuery>,
) -> Result<Response, CoordinatorError> {
    let ready = state
        .manager
        .start_migration(&pod_uid, query.container_names())
        .await?;
    respond_then_release(ready)
}

/// Sends the result with a body that releases the sync path only once the
/// whole payload has been handed to the transport.
fn respond_then_release(ready: ReadyMigration) -> Result<Response, CoordinatorError> {
    let ReadyMigration {
        migration_id,
        result,
        release,
        guard,
    } = ready;
    let payload = serde_json::to_vec(&result)
        .map_err(|e| CoordinatorError::Internal(format!("failed to encode result: {}", e)))?;
    info!(%migration_id, path = %result.path, "Sending migration result");

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, payload.len())
        .body(Body::from_stream(ReleaseOnComplete {
            chunk: Some(Bytes::from(payload)),
            release: Some(release),
            guard,
        }))
        .map_err(|e| CoordinatorError::Internal(e.to_string()))
}

/// Single-chunk body that fires `release` when hyper polls it past that chunk.
///
/// hyper asks for the next frame only after the previous one has been queued
/// on the connection, so by then every payload byte has been written or sits
/// in the connection's write buffer; it may not be flushed yet. The response
/// is length-delimited, so no chunked terminator is still owed at that point
/// and the client has a complete message as soon as those bytes arrive.
struct ReleaseOnComplete {
    chunk: Option<Bytes>,
    release: Option<oneshot::Sender<()>>,
    guard: Arc<RecordGuard>,
}

impl Stream for ReleaseOnComplete {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(chunk) = this.chunk.take() {
            return Poll::Ready(Some(Ok(chunk)));
        }
        // polled past the only chunk: the transport has the whole payload
        if let Some(release) = this.release.take() {
            this.guard.set_state(MigrationState::Completed);
            if release.send(()).is_ok() {
                info!("Migration result delivered, releasing source containers");
            } else {
                warn!("Sync path stopped waiting before the result was delivered");
            }
        }
        Poll::Ready(None)
    }
}

impl Drop for ReleaseOnComplete {
    fn drop(&mut self) {
        if self.release.is_some() {
            warn!("Migration response abandoned before completion, source containers keep running");
        }
    }
}

#[instrument(skip(state))]
async fn trigger_handler(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<MigrationResult>, CoordinatorError> {
    let pod = state
        .pods
        .get_pod(&namespace, &name)
        .await
        .map_err(|_| CoordinatorError::PodNotFound(format!("{}/{}", namespace, name)))?;
    let result = state.client.trigger_pod_migration(&pod).await.map_err(|e| {
        error!(error = %e, "Triggered migration failed");
        CoordinatorError::from(e)
    })?;
    Ok(Json(result))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::manager::SyncDispatcher;
    use crate::record::MigratePodOptions;
    use axum::http::Request;
    use podmig_common::{ContainerInfo, InMemoryPodRegistry, Pod, PodPhase};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Ready(String),
        Released(String),
        Aborted(String),
        Failed(String),
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        Succeed,
        Fail,
        Hang,
    }

    /// Sync path stand-in that records every rendezvous step. It drops its
    /// options before reporting the final event, as a finished sync path does.
    struct MockSyncPath {
        behaviour: Behaviour,
        events: mpsc::UnboundedSender<Event>,
        parked: Mutex<Vec<MigratePodOptions>>,
    }

    impl SyncDispatcher for MockSyncPath {
        fn dispatch(&self, pod: Pod, mut options: MigratePodOptions) {
            match self.behaviour {
                Behaviour::Hang => self.parked.lock().unwrap().push(options),
                Behaviour::Fail => {
                    options.signal_failed("runc checkpoint exited with 1");
                    let _ = self.events.send(Event::Failed(pod.uid));
                }
                Behaviour::Succeed => {
                    let events = self.events.clone();
                    tokio::spawn(async move {
                        for name in &options.containers {
                            std::fs::create_dir_all(options.checkpoint_dir.join(name)).unwrap();
                        }
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        let _ = events.send(Event::Ready(pod.uid.clone()));
                        options.signal_ready();
                        let event = match options.wait_until_finished(Duration::from_secs(5)).await {
                            Ok(()) => Event::Released(pod.uid),
                            Err(_) => Event::Aborted(pod.uid),
                        };
                        drop(options);
                        let _ = events.send(event);
                    });
                }
            }
        }
    }

    fn running_pod(uid: &str) -> Pod {
        Pod {
            uid: uid.to_string(),
            name: format!("web-{}", uid),
            namespace: "default".to_string(),
            phase: PodPhase::Running,
            host_ip: "127.0.0.1".to_string(),
            labels: HashMap::new(),
            containers: vec![
                ContainerInfo {
                    name: "app".to_string(),
                    container_id: format!("{}-app", uid),
                },
                ContainerInfo {
                    name: "sidecar".to_string(),
                    container_id: format!("{}-sidecar", uid),
                },
            ],
        }
    }

    struct TestApp {
        router: Router,
        manager: Arc<MigrationManager>,
        sync_path: Arc<MockSyncPath>,
        events: mpsc::UnboundedReceiver<Event>,
        root: tempfile::TempDir,
    }

    fn create_test_app(behaviour: Behaviour) -> TestApp {
        let root = tempfile::tempdir().unwrap();
        let registry = Arc::new(InMemoryPodRegistry::new());
        registry.insert(running_pod("uid-1"));
        registry.insert(running_pod("uid-2"));
        let mut stopped = running_pod("uid-3");
        stopped.phase = PodPhase::Succeeded;
        registry.insert(stopped);

        let config = NodeConfig {
            root_dir: root.path().to_path_buf(),
            ready_timeout: Duration::from_millis(300),
            ..Default::default()
        };
        let (tx, events) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(MockSyncPath {
            behaviour,
            events: tx,
            parked: Mutex::new(Vec::new()),
        });
        let manager = Arc::new(MigrationManager::new(
            &config,
            registry.clone(),
            dispatcher.clone(),
        ));
        let client = Arc::new(MigrationClient::new(&config, registry.clone()).unwrap());
        let router = create_router(AppState {
            manager: manager.clone(),
            client,
            pods: registry,
        });
        TestApp {
            router,
            manager,
            sync_path: dispatcher,
            events,
            root,
        }
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = create_test_app(Behaviour::Succeed);
        let response = app.router.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn test_migrate_unknown_pod_is_404() {
        let app = create_test_app(Behaviour::Succeed);
        let response = app.router.oneshot(get("/migrate/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["code"], "pod_not_found");
    }

    #[tokio::test]
    async fn test_migrate_rejections() {
        let app = create_test_app(Behaviour::Succeed);

        let response = app.router.clone().oneshot(get("/migrate/uid-3")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .router
            .clone()
            .oneshot(get("/migrate/uid-1?containers=app,db"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(app.manager.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_migrate_in_progress_is_409() {
        let mut app = create_test_app(Behaviour::Succeed);

        let first = app.router.clone().oneshot(get("/migrate/uid-1")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        // the first response body has not been consumed, so its record lives on
        let second = app.router.clone().oneshot(get("/migrate/uid-1")).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(second).await["code"], "migration_in_progress");

        json_body(first).await;
        assert_eq!(app.events.recv().await, Some(Event::Ready("uid-1".into())));
        assert_eq!(app.events.recv().await, Some(Event::Released("uid-1".into())));
    }

    #[tokio::test]
    async fn test_ready_then_response_then_release() {
        let mut app = create_test_app(Behaviour::Succeed);

        let response = app
            .router
            .clone()
            .oneshot(get("/migrate/uid-1?containers=app,%20sidecar"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_length: usize = response.headers()[header::CONTENT_LENGTH]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(app.events.recv().await, Some(Event::Ready("uid-1".into())));

        // the sync path stays parked until the body has been consumed
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(app.events.try_recv().is_err());
        assert_eq!(
            app.manager.find_migration_for_pod("uid-1").unwrap().state,
            MigrationState::Ready
        );

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.len(), content_length);
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let root = app.root.path().join("migration/uid-1");
        assert_eq!(body["Path"], root.to_string_lossy().into_owned());
        let containers = body["Containers"].as_object().unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers["app"], root.join("app").to_string_lossy().into_owned());
        assert_eq!(
            containers["sidecar"],
            root.join("sidecar").to_string_lossy().into_owned()
        );

        assert_eq!(app.events.recv().await, Some(Event::Released("uid-1".into())));
        assert!(app.manager.find_migration_for_pod("uid-1").is_none());
    }

    #[tokio::test]
    async fn test_abandoned_response_keeps_source_running() {
        let mut app = create_test_app(Behaviour::Succeed);

        let response = app.router.clone().oneshot(get("/migrate/uid-1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(app.events.recv().await, Some(Event::Ready("uid-1".into())));
        drop(response);

        assert_eq!(app.events.recv().await, Some(Event::Aborted("uid-1".into())));
        assert_eq!(app.manager.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_pods_have_independent_records() {
        let mut app = create_test_app(Behaviour::Succeed);

        let (a, b) = tokio::join!(
            app.router.clone().oneshot(get("/migrate/uid-1")),
            app.router.clone().oneshot(get("/migrate/uid-2")),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.status(), StatusCode::OK);
        assert_eq!(b.status(), StatusCode::OK);
        assert_eq!(app.manager.in_flight(), 2);

        let a_body = json_body(a).await;
        let b_body = json_body(b).await;
        assert_ne!(a_body["Path"], b_body["Path"]);

        let mut released = Vec::new();
        while released.len() < 2 {
            if let Some(Event::Released(uid)) = app.events.recv().await {
                released.push(uid);
            }
        }
        released.sort();
        assert_eq!(released, vec!["uid-1", "uid-2"]);
        assert_eq!(app.manager.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_ready_timeout_is_504_and_blocks_retry_until_sync_exits() {
        let app = create_test_app(Behaviour::Hang);

        let response = app.router.clone().oneshot(get("/migrate/uid-1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(json_body(response).await["code"], "ready_timeout");
        assert_eq!(
            app.manager.find_migration_for_pod("uid-1").unwrap().state,
            MigrationState::Failed
        );

        // the timed-out sync path has been told to stop but still holds the pod
        let retry = app.router.clone().oneshot(get("/migrate/uid-1")).await.unwrap();
        assert_eq!(retry.status(), StatusCode::CONFLICT);
        {
            let parked = app.sync_path.parked.lock().unwrap();
            assert_eq!(parked.len(), 1);
            assert!(parked[0].is_cancelled());
        }

        app.sync_path.parked.lock().unwrap().clear();
        assert_eq!(app.manager.in_flight(), 0);
        let retry = app.router.oneshot(get("/migrate/uid-1")).await.unwrap();
        assert_eq!(retry.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_checkpoint_failure_is_500() {
        let mut app = create_test_app(Behaviour::Fail);

        let response = app.router.clone().oneshot(get("/migrate/uid-1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["code"], "checkpoint_failed");
        assert!(body["error"].as_str().unwrap().contains("runc checkpoint exited"));
        assert_eq!(app.events.recv().await, Some(Event::Failed("uid-1".into())));
        assert_eq!(app.manager.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_trigger_without_clone_label_is_400() {
        let app = create_test_app(Behaviour::Succeed);
        let response = app
            .router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/trigger/default/web-uid-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_query_parsing() {
        let query = MigrateQuery {
            containers: Some(" app, ,sidecar,".to_string()),
        };
        assert_eq!(query.container_names(), vec!["app", "sidecar"]);
        assert!(MigrateQuery::default().container_names().is_empty());
    }
}
