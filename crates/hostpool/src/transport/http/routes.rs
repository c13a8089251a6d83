//! HTTP route handlers.
//!
//! `GET /hosts` blocks until a host is ready and answers with its IP address
//! as plain text. While the caller waits, a newline is written every
//! heartbeat interval so proxies and clients keep the connection open. A
//! request that finishes before the first heartbeat gets a plain response
//! with a real status code; once heartbeats have started the status is
//! committed to 200 and an error can only be reported in the body.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Interval, MissedTickBehavior};

use crate::coordinator::{HostGrant, RequestCoordinator, RequestError};
use crate::lifecycle::LifecycleError;
use crate::signal::{DisconnectGuard, DisconnectNotice};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const HEARTBEAT: &str = "\n";

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<RequestCoordinator>,
    pub heartbeat_interval: Duration,
}

type Outcome = Result<HostGrant, RequestError>;

fn flatten(joined: Result<Outcome, JoinError>) -> Outcome {
    joined.unwrap_or_else(|e| {
        tracing::error!(error = %e, "Host request task failed");
        Err(RequestError::Lifecycle(LifecycleError::Lost))
    })
}

/// Body text for a finished request. `None` means the caller is gone.
fn outcome_text(outcome: &Outcome) -> Option<String> {
    match outcome {
        Ok(grant) => Some(grant.ip_address.clone()),
        Err(RequestError::Disconnected) => None,
        Err(e) => Some(e.to_string()),
    }
}

fn outcome_response(outcome: Outcome) -> Response {
    let status = match &outcome {
        Ok(_) => StatusCode::OK,
        Err(RequestError::Disconnected) => return StatusCode::NO_CONTENT.into_response(),
        Err(RequestError::ShuttingDown) => StatusCode::SERVICE_UNAVAILABLE,
        Err(RequestError::Lifecycle(e)) => {
            tracing::warn!(error = %e, "Host request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let text = outcome_text(&outcome).unwrap_or_default();
    (status, [(header::CONTENT_TYPE, TEXT_PLAIN)], text).into_response()
}

async fn request_host(State(state): State<AppState>) -> Response {
    let (notice, mut guard) = DisconnectNotice::pair();
    let mut work = {
        let coordinator = Arc::clone(&state.coordinator);
        tokio::spawn(async move { coordinator.request_host(notice).await })
    };

    tokio::select! {
        joined = &mut work => {
            guard.disarm();
            return outcome_response(flatten(joined));
        }
        _ = tokio::time::sleep(state.heartbeat_interval) => {}
    }

    tracing::debug!("Host not ready yet, streaming heartbeats");
    let mut ticker = tokio::time::interval(state.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let stream = Heartbeats {
        work,
        guard,
        ticker,
    }
    .into_stream();

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, TEXT_PLAIN)],
        Body::from_stream(stream),
    )
        .into_response()
}

/// Streaming state. Dropping it before the result is written (the caller hung
/// up) drops the guard and fires the disconnect notice.
struct Heartbeats {
    work: JoinHandle<Outcome>,
    guard: DisconnectGuard,
    ticker: Interval,
}

enum Beat {
    Done(Outcome),
    Tick,
}

impl Heartbeats {
    fn into_stream(self) -> impl futures::Stream<Item = Result<String, Infallible>> + Send {
        futures::stream::unfold(Some(self), |state| async move {
            let mut beats = state?;
            let beat = tokio::select! {
                joined = &mut beats.work => Beat::Done(flatten(joined)),
                _ = beats.ticker.tick() => Beat::Tick,
            };
            match beat {
                Beat::Tick => Some((Ok(HEARTBEAT.to_string()), Some(beats))),
                Beat::Done(outcome) => {
                    beats.guard.disarm();
                    if let Err(RequestError::Lifecycle(e)) = &outcome {
                        tracing::warn!(error = %e, "Host request failed after heartbeats started");
                    }
                    let text = outcome_text(&outcome)?;
                    Some((Ok(text), None))
                }
            }
        })
    }
}

async fn method_not_allowed() -> StatusCode {
    StatusCode::METHOD_NOT_ALLOWED
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

pub fn routes(coordinator: Arc<RequestCoordinator>, heartbeat_interval: Duration) -> Router {
    Router::new()
        .route("/hosts", get(request_host).head(method_not_allowed))
        .fallback(not_found)
        .with_state(AppState {
            coordinator,
            heartbeat_interval,
        })
}
