// src/api.rs
use std::sync::Arc;
use std::time::Duration as StdDuration;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRef, FromRequestParts, Query, State};
use axum::http::request::Parts;
use axum::http::header::AUTHORIZATION;
use axum::routing::{get, post};
use axum::{async_trait, Json, Router};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::debug;

use crate::assignment;
use crate::config::Policy;
use crate::credential::Credentials;
use crate::error::{ApiError, AuthFailure};
use crate::ingest;
use crate::model::{BloodPressureReading, HeartRateReading, TimeWindow};
use crate::query::{self, Aggregate};
use crate::store::Store;
use crate::timestamp;
use crate::types::*;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub credentials: Arc<Credentials>,
    pub policy: Policy,
}

impl FromRef<AppState> for Arc<Credentials> {
    fn from_ref(state: &AppState) -> Self {
        state.credentials.clone()
    }
}

pub fn router(state: AppState, timeout: StdDuration) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/ingest", post(ingest_reading))
        .route("/readings/hr", get(heart_rate_readings))
        .route("/readings/bp", get(blood_pressure_readings))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
}

/// Device id taken from a verified `Authorization: Bearer` token.
#[derive(Debug, Clone)]
pub struct AuthDevice(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for AuthDevice
where
    Arc<Credentials>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token)
            .ok_or(ApiError::Unauthenticated(AuthFailure::MissingToken))?;
        let credentials = Arc::<Credentials>::from_ref(state);
        Ok(AuthDevice(credentials.verify(token)?))
    }
}

fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

// ---------- API HANDLERS ---------- //

async fn register(
    State(state): State<AppState>,
    body: Result<Json<RegisterReq>, JsonRejection>,
) -> Result<Json<TokenRes>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::Validation(e.body_text()))?;
    let device = assignment::enroll(state.store.as_ref(), &req, state.policy.reregistration).await?;
    let token = state.credentials.issue(&device.device_id)?;
    Ok(Json(TokenRes::bearer(token)))
}

async fn ingest_reading(
    State(state): State<AppState>,
    AuthDevice(device_id): AuthDevice,
    body: Result<Json<ReadingInput>, JsonRejection>,
) -> Result<Json<IngestRes>, ApiError> {
    let Json(reading) = body.map_err(|e| ApiError::Validation(e.body_text()))?;
    let id = ingest::ingest(state.store.as_ref(), state.policy.assignment, &device_id, &reading).await?;
    Ok(Json(IngestRes {
        status: "ok".into(),
        id,
    }))
}

/// Resolve the window and aggregate for a readings request. The token
/// subject must still name a registered device. Offsets on `from_time` and
/// `to_time` are dropped; a raw `+` that decodes to a space is tolerated.
async fn prepare(
    state: &AppState,
    device_id: &str,
    params: Result<Query<ReadingsParams>, QueryRejection>,
) -> Result<(TimeWindow, Option<Aggregate>), ApiError> {
    let Query(params) = params.map_err(|e| ApiError::Validation(e.body_text()))?;
    if state.store.find_device(device_id).await?.is_none() {
        return Err(ApiError::Unauthenticated(AuthFailure::UnknownDevice));
    }
    let aggregate = match params.aggregate.as_deref().map(str::parse::<Aggregate>) {
        Some(Ok(aggregate)) => Some(aggregate),
        Some(Err(reason)) => {
            debug!(%reason, "returning raw rows");
            None
        }
        None => None,
    };
    let window = TimeWindow {
        from: params.from_time,
        to: params.to_time,
    };
    Ok((window, aggregate))
}

async fn heart_rate_readings(
    State(state): State<AppState>,
    AuthDevice(device_id): AuthDevice,
    params: Result<Query<ReadingsParams>, QueryRejection>,
) -> Result<Json<Vec<HeartRateReading>>, ApiError> {
    let (window, aggregate) = prepare(&state, &device_id, params).await?;
    let rows = query::heart_rate(
        state.store.as_ref(),
        &device_id,
        window,
        aggregate,
        timestamp::now(),
    )
    .await?;
    Ok(Json(rows))
}

async fn blood_pressure_readings(
    State(state): State<AppState>,
    AuthDevice(device_id): AuthDevice,
    params: Result<Query<ReadingsParams>, QueryRejection>,
) -> Result<Json<Vec<BloodPressureReading>>, ApiError> {
    let (window, aggregate) = prepare(&state, &device_id, params).await?;
    let rows = query::blood_pressure(
        state.store.as_ref(),
        &device_id,
        window,
        aggregate,
        timestamp::now(),
    )
    .await?;
    Ok(Json(rows))
}
