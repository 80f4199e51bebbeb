//! Admin HTTP surface: the `/manual/*` operator routes plus `/healthz`
//! and `/metrics`, registered as explicit route -> handler pairs (§6,
//! §9's guidance against annotation-driven dispatch). Built on the same
//! `hyper`/`hyper-util`/`http-body-util` stack the teacher already uses
//! for its metrics endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::ChannelBehavior;
use crate::gate::{CandidateItem, GateOutcome, IngestionGate};
use crate::metrics;
use crate::reconciler::StaleJobReconciler;
use crate::scheduler::UploadScheduler;
use crate::store::JobStore;

pub struct AdminState {
    pub store: JobStore,
    pub gate: Arc<IngestionGate>,
    pub scheduler: Arc<UploadScheduler>,
    pub reconciler: Arc<StaleJobReconciler>,
    pub channel: ChannelBehavior,
}

pub async fn serve(addr: SocketAddr, state: Arc<AdminState>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "Admin server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, std::convert::Infallible>(route(state, req).await) }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!(error = %e, "Error serving admin connection");
            }
        });
    }
}

async fn route(state: Arc<AdminState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (&method, path.as_str()) {
        (&Method::GET, "/healthz") => healthz(&state).await,
        (&Method::GET, "/metrics") => text_response(StatusCode::OK, metrics::gather_metrics()),
        (&Method::POST, "/manual/create") => manual_create(&state, req).await,
        (&Method::POST, "/manual/topic") => manual_create(&state, req).await,
        (&Method::POST, "/manual/async/topic") => manual_async_topic(&state, req).await,
        (&Method::POST, "/manual/batch/topic") => manual_batch_topic(&state, req).await,
        (&Method::POST, "/manual/scheduler/trigger") => scheduler_trigger(&state).await,
        (&Method::POST, "/manual/cleanup/trigger") => cleanup_trigger(&state).await,
        (&Method::GET, p) if p.starts_with("/manual/status/") => {
            let id = p.trim_start_matches("/manual/status/");
            manual_status(&state, id).await
        }
        _ => json_response(StatusCode::NOT_FOUND, json!({"error": "not found"})),
    }
}

async fn healthz(state: &AdminState) -> Response<Full<Bytes>> {
    let store_ok = state.store.count_active(&state.channel.channel_id).await.is_ok();
    let status = if store_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    json_response(status, json!({"store": store_ok}))
}

#[derive(Deserialize)]
struct CreateRequest {
    title: String,
    summary: String,
    #[serde(default)]
    link: Option<String>,
}

async fn manual_create(state: &AdminState, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let Some(body) = read_json::<CreateRequest>(req).await else {
        return json_response(StatusCode::BAD_REQUEST, json!({"error": "invalid request body"}));
    };

    let link = body.link.unwrap_or_else(|| format!("manual://{}", uuid::Uuid::new_v4()));
    let item = CandidateItem { title: body.title, summary: body.summary, link };

    match state.gate.admit(&state.channel, item).await {
        Ok(GateOutcome::Admitted { job_id }) => json_response(StatusCode::OK, json!({"id": job_id, "stage": "QUEUED", "message": "admitted"})),
        Ok(outcome) => json_response(StatusCode::OK, json!({"stage": "REJECTED", "message": format!("{outcome:?}")})),
        Err(e) => json_response(StatusCode::INTERNAL_SERVER_ERROR, json!({"error": e.to_string()})),
    }
}

async fn manual_async_topic(state: &AdminState, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let Some(body) = read_json::<CreateRequest>(req).await else {
        return json_response(StatusCode::BAD_REQUEST, json!({"error": "invalid request body"}));
    };

    let gate = state.gate.clone();
    let channel = state.channel.clone();
    let link = body.link.unwrap_or_else(|| format!("manual://{}", uuid::Uuid::new_v4()));
    let item = CandidateItem { title: body.title, summary: body.summary, link };

    tokio::spawn(async move {
        if let Err(e) = gate.admit(&channel, item).await {
            warn!(error = %e, "async manual topic admission failed");
        }
    });

    json_response(
        StatusCode::ACCEPTED,
        json!({"id": serde_json::Value::Null, "stage": "PENDING", "message": "accepted for asynchronous processing"}),
    )
}

#[derive(Deserialize)]
struct BatchRequest {
    topics: Vec<String>,
    #[serde(default)]
    style: Option<String>,
}

async fn manual_batch_topic(state: &AdminState, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let Some(body) = read_json::<BatchRequest>(req).await else {
        return json_response(StatusCode::BAD_REQUEST, json!({"error": "invalid request body"}));
    };

    let gate = state.gate.clone();
    let channel = state.channel.clone();
    let count = body.topics.len();

    tokio::spawn(async move {
        for topic in body.topics {
            let item = CandidateItem {
                title: topic,
                summary: body.style.clone().unwrap_or_default(),
                link: format!("manual://{}", uuid::Uuid::new_v4()),
            };
            if let Err(e) = gate.admit(&channel, item).await {
                warn!(error = %e, "batch manual topic admission failed");
            }
        }
    });

    json_response(StatusCode::ACCEPTED, json!({"stage": "PENDING", "message": format!("{count} topics accepted")}))
}

async fn manual_status(state: &AdminState, id: &str) -> Response<Full<Bytes>> {
    match state.store.get(id).await {
        Ok(Some(job)) => json_response(StatusCode::OK, serde_json::to_value(&job).unwrap_or_default()),
        Ok(None) => json_response(StatusCode::NOT_FOUND, json!({"error": "job not found"})),
        Err(e) => json_response(StatusCode::INTERNAL_SERVER_ERROR, json!({"error": e.to_string()})),
    }
}

async fn scheduler_trigger(state: &AdminState) -> Response<Full<Bytes>> {
    match state.scheduler.tick(&state.channel).await {
        Ok(outcome) => json_response(StatusCode::OK, json!({"outcome": format!("{outcome:?}")})),
        Err(e) => json_response(StatusCode::INTERNAL_SERVER_ERROR, json!({"error": e.to_string()})),
    }
}

async fn cleanup_trigger(state: &AdminState) -> Response<Full<Bytes>> {
    match state.reconciler.sweep_once().await {
        Ok(swept) => json_response(StatusCode::OK, json!({"swept": swept})),
        Err(e) => json_response(StatusCode::INTERNAL_SERVER_ERROR, json!({"error": e.to_string()})),
    }
}

async fn read_json<T: for<'de> Deserialize<'de>>(req: Request<Incoming>) -> Option<T> {
    let bytes = req.into_body().collect().await.ok()?.to_bytes();
    serde_json::from_slice(&bytes).ok()
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(&body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(bytes)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}
