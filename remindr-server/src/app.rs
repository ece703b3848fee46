//! The HTTP trigger surface.
//!
//! External cron services drive the queue through two endpoints, each accepting `GET` and `POST`:
//!
//! - `/api/cron/schedule-emails` runs one scheduler pass;
//! - `/api/cron/process-emails` runs one batch.
//!
//! Both sit behind [`require_cron_secret`]. `/health` does not.
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use remindr::{backend::Backend, batch::BatchRunner, scheduler::Scheduler};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::auth::{require_cron_secret, CronAuth};

pub struct AppState<B> {
    pub scheduler: Arc<Scheduler<B>>,
    pub batch: Arc<BatchRunner<B>>,
}

impl<B> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
            batch: self.batch.clone(),
        }
    }
}

impl<B> AppState<B> {
    pub fn new(scheduler: Scheduler<B>, batch: BatchRunner<B>) -> Self {
        Self {
            scheduler: Arc::new(scheduler),
            batch: Arc::new(batch),
        }
    }
}

pub fn router<B>(state: AppState<B>, auth: CronAuth) -> Router
where
    B: Backend + 'static,
{
    let triggers = Router::new()
        .route(
            "/api/cron/schedule-emails",
            get(schedule_emails::<B>).post(schedule_emails::<B>),
        )
        .route(
            "/api/cron/process-emails",
            get(process_emails::<B>).post(process_emails::<B>),
        )
        .route_layer(middleware::from_fn_with_state(auth, require_cron_secret))
        .with_state(state);

    Router::new()
        .route("/health", get(health))
        .merge(triggers)
        .layer(TraceLayer::new_for_http())
}

fn internal_error(error: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": error.to_string() })),
    )
        .into_response()
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn schedule_emails<B>(State(state): State<AppState<B>>) -> Response
where
    B: Backend + 'static,
{
    match state.scheduler.run_once(Utc::now()).await {
        Ok(report) => Json(report).into_response(),
        Err(error) => {
            tracing::error!(?error, "Scheduler pass failed: {error}");
            internal_error(error)
        }
    }
}

async fn process_emails<B>(State(state): State<AppState<B>>) -> Response
where
    B: Backend + 'static,
{
    match state.batch.run().await {
        Ok(report) => Json(report).into_response(),
        Err(error) => {
            tracing::error!(?error, "Batch failed: {error}");
            internal_error(error)
        }
    }
}

#[cfg(test)]
mod test {
    use axum::{
        body::{to_bytes, Body},
        http::{header::AUTHORIZATION, Method, Request},
    };
    use chrono::NaiveTime;
    use remindr::{
        backend::memory::InMemoryBackend,
        collaborator::{Role, TaskSummary, Tenant, User},
        processor::{Collaborators, JobProcessor},
        scheduler::DeliveryWindow,
        testing::{EchoRenderer, RecordingMailer, StaticDirectory, StaticSummaries},
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;

    const SECRET: &str = "s3cret";

    fn directory() -> StaticDirectory {
        StaticDirectory::default()
            .with_tenant(Tenant {
                id: "firm-1".into(),
                name: "Mehta & Co".to_owned(),
                timezone: Some("Asia/Kolkata".to_owned()),
            })
            .with_user(User {
                id: "user-1".into(),
                firm_id: "firm-1".into(),
                email: "user-1@example.com".to_owned(),
                name: "Ravi".to_owned(),
                role: Role::Staff,
                active: true,
            })
    }

    fn app_with(directory: StaticDirectory, auth: CronAuth) -> (Router, Arc<RecordingMailer>) {
        let backend = InMemoryBackend::new();
        let directory = Arc::new(directory);
        let mailer = Arc::new(RecordingMailer::new());
        let collaborators = Collaborators {
            users: directory.clone(),
            summaries: Arc::new(StaticSummaries::default().with_user(
                "user-1",
                TaskSummary {
                    total_count: 2,
                    overdue_count: 1,
                    due_today_count: 0,
                },
            )),
            renderer: Arc::new(EchoRenderer::default()),
            mailer: mailer.clone(),
        };
        let always_open = DeliveryWindow::new(
            NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(23, 59, 0).unwrap(),
        )
        .unwrap();
        let state = AppState::new(
            Scheduler::new(backend.clone(), directory).with_window(always_open),
            BatchRunner::new(JobProcessor::new(backend, collaborators)),
        );
        (router(state, auth), mailer)
    }

    fn app(auth: CronAuth) -> (Router, Arc<RecordingMailer>) {
        app_with(directory(), auth)
    }

    fn request(method: Method, uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_needs_no_token() {
        let (app, _) = app(CronAuth::new(Some(SECRET.to_owned())));

        let (status, body) = send(&app, request(Method::GET, "/health", None)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn triggers_reject_missing_or_wrong_tokens() {
        let (app, _) = app(CronAuth::new(Some(SECRET.to_owned())));

        for uri in ["/api/cron/schedule-emails", "/api/cron/process-emails"] {
            for token in [None, Some("wrong")] {
                let (status, body) = send(&app, request(Method::POST, uri, token)).await;

                assert_eq!(status, StatusCode::UNAUTHORIZED);
                assert_eq!(body, json!({ "error": "Unauthorized" }));
            }
        }
    }

    #[tokio::test]
    async fn schedule_then_process() {
        let (app, mailer) = app(CronAuth::new(Some(SECRET.to_owned())));

        let (status, body) = send(
            &app,
            request(Method::GET, "/api/cron/schedule-emails", Some(SECRET)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["jobsCreated"], 1);
        assert!(body["logs"].as_array().is_some_and(|logs| !logs.is_empty()));

        let (status, body) = send(
            &app,
            request(Method::POST, "/api/cron/process-emails", Some(SECRET)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({
                "success": true,
                "processed": 1,
                "results": [{ "id": 0, "status": "sent" }],
            })
        );
        assert_eq!(mailer.sent().len(), 1);
        assert_eq!(mailer.sent()[0].to, "user-1@example.com");
    }

    #[tokio::test]
    async fn second_schedule_pass_creates_nothing() {
        let (app, _) = app(CronAuth::default());

        send(&app, request(Method::POST, "/api/cron/schedule-emails", None)).await;
        let (status, body) =
            send(&app, request(Method::POST, "/api/cron/schedule-emails", None)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["jobsCreated"], 0);
    }

    #[tokio::test]
    async fn empty_batch() {
        let (app, _) = app(CronAuth::default());

        let (status, body) =
            send(&app, request(Method::GET, "/api/cron/process-emails", None)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({ "success": true, "processed": 0, "results": [] })
        );
    }

    #[tokio::test]
    async fn scheduler_failures_are_server_errors() {
        let (app, _) = app_with(
            directory().failing_tenants("connection refused"),
            CronAuth::default(),
        );

        let (status, body) =
            send(&app, request(Method::POST, "/api/cron/schedule-emails", None)).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"]
            .as_str()
            .is_some_and(|error| error.contains("connection refused")));
    }
}
