use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;

use vitals_ingest::model::{
    Assignment, BloodPressureReading, Device, HeartRateReading, NewBloodPressure, NewHeartRate,
    Patient, TimeWindow,
};
use vitals_ingest::store::{InsertResult, MemoryStore, Session, Store, StoreError};
use vitals_ingest::{router, AppState, AssignmentPolicy, Credentials, Policy, ReregistrationPolicy};

const SEED: [u8; 32] = [42u8; 32];

struct Harness {
    app: Router,
    store: MemoryStore,
}

fn harness(policy: Policy) -> Harness {
    let store = MemoryStore::new();
    let app = app_with(Arc::new(store.clone()), policy);
    Harness { app, store }
}

fn app_with(store: Arc<dyn Store>, policy: Policy) -> Router {
    let state = AppState {
        store,
        credentials: Arc::new(Credentials::from_seed(SEED, Duration::days(7))),
        policy,
    };
    router(state, StdDuration::from_secs(10))
}

fn strict() -> Policy {
    Policy {
        assignment: AssignmentPolicy::Strict,
        ..Policy::default()
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

async fn post(app: &Router, uri: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
    let mut req = Request::post(uri).header("content-type", "application/json");
    if let Some(token) = token {
        req = req.header("authorization", format!("Bearer {token}"));
    }
    send(app, req.body(Body::from(body.to_string())).unwrap()).await
}

async fn get(app: &Router, uri: &str, token: &str) -> (StatusCode, Value) {
    let req = Request::get(uri)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    send(app, req).await
}

async fn register(app: &Router, device_id: &str, device_type: &str, patient_id: Option<&str>) -> String {
    let mut body = json!({ "device_id": device_id, "device_type": device_type });
    if let Some(p) = patient_id {
        body["patient_id"] = json!(p);
    }
    let (status, res) = post(app, "/register", None, body).await;
    assert_eq!(status, StatusCode::OK, "{res}");
    assert_eq!(res["token_type"], "bearer");
    res["access_token"].as_str().unwrap().to_string()
}

fn heart_rate(device_id: &str, patient_id: &str, timestamp: &str, value: i32) -> Value {
    json!({
        "type": "heart_rate",
        "device_id": device_id,
        "patient_id": patient_id,
        "timestamp": timestamp,
        "heart_rate": value,
        "measurement_quality": "good"
    })
}

fn blood_pressure(device_id: &str, patient_id: &str, timestamp: &str, s: i32, d: i32, p: i32) -> Value {
    json!({
        "type": "blood_pressure",
        "device_id": device_id,
        "patient_id": patient_id,
        "timestamp": timestamp,
        "systolic": s,
        "diastolic": d,
        "pulse": p
    })
}

#[tokio::test]
async fn ingest_then_read_returns_submitted_values() {
    let h = harness(strict());
    let token = register(&h.app, "HR001", "heart_rate", Some("P001")).await;

    let (status, res) = post(
        &h.app,
        "/ingest",
        Some(&token),
        heart_rate("HR001", "P001", "2024-05-01T12:00:00.987+02:00", 75),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{res}");
    assert_eq!(res["status"], "ok");
    let id = res["id"].as_i64().unwrap();

    let (status, rows) = get(&h.app, "/readings/hr", &token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        rows,
        json!([{
            "id": id,
            "device_id": "HR001",
            "patient_id": "P001",
            "timestamp": "2024-05-01T12:00:00",
            "heart_rate": 75,
            "quality": "good"
        }])
    );
}

#[tokio::test]
async fn blood_pressure_round_trip() {
    let h = harness(strict());
    let token = register(&h.app, "BP001", "blood_pressure", Some("P001")).await;
    let (status, _) = post(
        &h.app,
        "/ingest",
        Some(&token),
        blood_pressure("BP001", "P001", "2024-05-01T12:00:00", 120, 80, 72),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, rows) = get(&h.app, "/readings/bp", &token).await;
    assert_eq!(rows[0]["systolic"], 120);
    assert_eq!(rows[0]["diastolic"], 80);
    assert_eq!(rows[0]["pulse"], 72);
    assert!(rows[0].get("label").is_none());
}

#[tokio::test]
async fn mismatched_device_is_forbidden_and_not_written() {
    let h = harness(Policy::default());
    let token = register(&h.app, "HR001", "heart_rate", Some("P001")).await;
    register(&h.app, "HR002", "heart_rate", Some("P001")).await;

    let (status, res) = post(
        &h.app,
        "/ingest",
        Some(&token),
        heart_rate("HR002", "P001", "2024-05-01T12:00:00", 75),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(res["error"]["code"], "IDENTITY_MISMATCH");
    assert_eq!(h.store.reading_count().unwrap(), 0);
}

#[tokio::test]
async fn strict_policy_rejects_unassigned_patient() {
    let h = harness(strict());
    let token = register(&h.app, "HR001", "heart_rate", Some("P001")).await;
    let (status, res) = post(
        &h.app,
        "/ingest",
        Some(&token),
        heart_rate("HR001", "UNKNOWN", "2024-05-01T12:00:00", 90),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(res["error"]["code"], "NOT_ASSIGNED");
    assert_eq!(h.store.patient_count().unwrap(), 1);
}

#[tokio::test]
async fn auto_assign_policy_onboards_patient() {
    let h = harness(Policy::default());
    let token = register(&h.app, "HR001", "heart_rate", None).await;
    let (status, _) = post(
        &h.app,
        "/ingest",
        Some(&token),
        heart_rate("HR001", "P777", "2024-05-01T12:00:00", 90),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(h.store.patient_count().unwrap(), 1);
    assert_eq!(h.store.assignment_count().unwrap(), 1);
}

#[tokio::test]
async fn bad_tokens_are_unauthenticated() {
    let h = harness(Policy::default());
    register(&h.app, "HR001", "heart_rate", Some("P001")).await;

    let (status, res) = get(&h.app, "/readings/hr", "invalid_token").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(res["error"]["code"], "TOKEN_INVALID");

    let issuer = Credentials::from_seed(SEED, Duration::minutes(5));
    let expired = issuer
        .issue_at("HR001", Utc::now() - Duration::minutes(10))
        .unwrap();
    for uri in ["/readings/hr", "/readings/bp"] {
        let (status, res) = get(&h.app, uri, &expired).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(res["error"]["code"], "TOKEN_EXPIRED");
    }
    let (status, res) = post(
        &h.app,
        "/ingest",
        Some(&expired),
        heart_rate("HR001", "P001", "2024-05-01T12:00:00", 70),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(res["error"]["code"], "TOKEN_EXPIRED");

    let foreign = Credentials::from_seed([1u8; 32], Duration::days(1))
        .issue("HR001")
        .unwrap();
    let (status, _) = get(&h.app, "/readings/hr", &foreign).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, res) = post(
        &h.app,
        "/ingest",
        None,
        heart_rate("HR001", "P001", "2024-05-01T12:00:00", 70),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(res["error"]["code"], "AUTH_REQUIRED");
    assert_eq!(h.store.reading_count().unwrap(), 0);
}

#[tokio::test]
async fn token_for_unregistered_device_is_rejected() {
    let h = harness(Policy::default());
    let ghost = Credentials::from_seed(SEED, Duration::days(1))
        .issue("GHOST")
        .unwrap();
    let (status, res) = get(&h.app, "/readings/hr", &ghost).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(res["error"]["code"], "DEVICE_UNKNOWN");
}

#[tokio::test]
async fn reregistration_reissues_without_duplicating() {
    let h = harness(Policy::default());
    let first = register(&h.app, "HR001", "heart_rate", None).await;
    let second = register(&h.app, "HR001", "heart_rate", Some("P001")).await;
    assert_eq!(h.store.device_count().unwrap(), 1);
    assert_eq!(h.store.assignment_count().unwrap(), 1);

    for token in [&first, &second] {
        let (status, _) = get(&h.app, "/readings/hr", token).await;
        assert_eq!(status, StatusCode::OK);
    }
}

#[tokio::test]
async fn reregistration_can_be_rejected() {
    let h = harness(Policy {
        reregistration: ReregistrationPolicy::Reject,
        ..Policy::default()
    });
    register(&h.app, "HR001", "heart_rate", None).await;
    let (status, res) = post(
        &h.app,
        "/register",
        None,
        json!({ "device_id": "HR001", "device_type": "heart_rate" }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(res["error"]["code"], "DEVICE_EXISTS");
    assert_eq!(h.store.device_count().unwrap(), 1);
}

#[tokio::test]
async fn invalid_payloads_are_422() {
    let h = harness(Policy::default());
    let token = register(&h.app, "HR001", "heart_rate", Some("P001")).await;

    let (status, res) = post(
        &h.app,
        "/ingest",
        Some(&token),
        heart_rate("HR001", "P001", "2024-05-01T12:00:00", 0),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(res["error"]["code"], "VALIDATION");

    let (status, _) = post(
        &h.app,
        "/ingest",
        Some(&token),
        json!({ "device_id": "HR001", "patient_id": "P001", "timestamp": "2024-05-01T12:00:00" }),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = post(
        &h.app,
        "/ingest",
        Some(&token),
        heart_rate("HR001", "P001", "not a time", 70),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = get(&h.app, "/readings/hr?from_time=tuesday", &token).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(h.store.reading_count().unwrap(), 0);
}

#[tokio::test]
async fn untagged_bodies_are_accepted() {
    let h = harness(strict());
    let hr_token = register(&h.app, "HR001", "heart_rate", Some("P001")).await;
    let bp_token = register(&h.app, "BP001", "blood_pressure", Some("P001")).await;

    let (status, res) = post(
        &h.app,
        "/ingest",
        Some(&hr_token),
        json!({
            "device_id": "HR001",
            "patient_id": "P001",
            "timestamp": "2024-05-01T12:00:00.123456",
            "heart_rate": 75,
            "measurement_quality": "good"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{res}");

    let (status, res) = post(
        &h.app,
        "/ingest",
        Some(&bp_token),
        json!({
            "device_id": "BP001",
            "patient_id": "P001",
            "timestamp": "2024-05-01T12:00:00.123456",
            "systolic": 120,
            "diastolic": 80,
            "pulse": 72
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{res}");

    let (_, rows) = get(&h.app, "/readings/hr", &hr_token).await;
    assert_eq!(rows[0]["heart_rate"], 75);
    assert_eq!(rows[0]["timestamp"], "2024-05-01T12:00:00");
    let (_, rows) = get(&h.app, "/readings/bp", &bp_token).await;
    assert_eq!(rows[0]["systolic"], 120);
}

#[tokio::test]
async fn unencoded_offset_in_query_is_accepted() {
    let h = harness(strict());
    let token = register(&h.app, "HR001", "heart_rate", Some("P001")).await;
    seed_heart_rates(&h.app, &token).await;

    let (status, rows) = get(
        &h.app,
        "/readings/hr?from_time=2024-01-01T10:00:30+02:00",
        &token,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{rows}");
    assert_eq!(rows.as_array().unwrap().len(), 2);
}

async fn seed_heart_rates(app: &Router, token: &str) {
    for (ts, value) in [
        ("2024-01-01T10:00:00", 60),
        ("2024-01-01T10:00:30", 70),
        ("2024-01-01T10:01:00", 80),
    ] {
        let (status, _) = post(app, "/ingest", Some(token), heart_rate("HR001", "P001", ts, value)).await;
        assert_eq!(status, StatusCode::OK);
    }
}

#[tokio::test]
async fn heart_rate_aggregates() {
    let h = harness(strict());
    let token = register(&h.app, "HR001", "heart_rate", Some("P001")).await;
    seed_heart_rates(&h.app, &token).await;

    for (agg, expected) in [("min", 60), ("max", 80), ("avg", 70)] {
        let (status, rows) = get(&h.app, &format!("/readings/hr?aggregate={agg}"), &token).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(rows.as_array().unwrap().len(), 1);
        assert_eq!(rows[0]["heart_rate"], expected, "{agg}");
        assert_eq!(rows[0]["quality"], agg);
        assert_eq!(rows[0]["id"], 0);
        assert_eq!(rows[0]["patient_id"], "P001");
    }

    let (_, rows) = get(
        &h.app,
        "/readings/hr?aggregate=max&to_time=2024-01-01T10:00:30",
        &token,
    )
    .await;
    assert_eq!(rows[0]["heart_rate"], 70);
    assert_eq!(rows[0]["timestamp"], "2024-01-01T10:00:30");
}

#[tokio::test]
async fn raw_window_is_inclusive() {
    let h = harness(strict());
    let token = register(&h.app, "HR001", "heart_rate", Some("P001")).await;
    seed_heart_rates(&h.app, &token).await;

    let (_, rows) = get(
        &h.app,
        "/readings/hr?from_time=2024-01-01T10:00:30&to_time=2024-01-01T10:01:00",
        &token,
    )
    .await;
    let values: Vec<i64> = rows
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["heart_rate"].as_i64().unwrap())
        .collect();
    assert_eq!(values, vec![70, 80]);

    let (_, rows) = get(&h.app, "/readings/hr?aggregate=median", &token).await;
    assert_eq!(rows.as_array().unwrap().len(), 3);
    assert_eq!(rows[0]["quality"], "good");
}

#[tokio::test]
async fn empty_window_aggregates_to_zero() {
    let h = harness(strict());
    let token = register(&h.app, "BP001", "blood_pressure", Some("P001")).await;
    let (status, _) = post(
        &h.app,
        "/ingest",
        Some(&token),
        blood_pressure("BP001", "P001", "2024-01-01T10:00:00", 120, 80, 70),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, rows) = get(
        &h.app,
        "/readings/bp?aggregate=avg&from_time=2030-01-01T00:00:00",
        &token,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rows.as_array().unwrap().len(), 1);
    assert_eq!(rows[0]["patient_id"], "P001");
    assert_eq!(rows[0]["systolic"], 0);
    assert_eq!(rows[0]["diastolic"], 0);
    assert_eq!(rows[0]["pulse"], 0);
    assert_eq!(rows[0]["label"], "avg");
}

#[tokio::test]
async fn blood_pressure_aggregates() {
    let h = harness(strict());
    let token = register(&h.app, "BP001", "blood_pressure", Some("P001")).await;
    for (ts, s) in [
        ("2024-01-01T10:00:00", 120),
        ("2024-01-01T10:05:00", 110),
        ("2024-01-01T10:10:00", 130),
    ] {
        post(&h.app, "/ingest", Some(&token), blood_pressure("BP001", "P001", ts, s, 80, 70)).await;
    }
    for (agg, expected) in [("min", 110), ("max", 130), ("avg", 120)] {
        let (_, rows) = get(&h.app, &format!("/readings/bp?aggregate={agg}"), &token).await;
        assert_eq!(rows[0]["systolic"], expected, "{agg}");
        assert_eq!(rows[0]["diastolic"], 80);
        assert_eq!(rows[0]["pulse"], 70);
    }
}

#[tokio::test]
async fn readings_are_scoped_to_the_token_device() {
    let h = harness(Policy::default());
    let a = register(&h.app, "HR001", "heart_rate", Some("P001")).await;
    let b = register(&h.app, "HR002", "heart_rate", Some("P002")).await;
    post(&h.app, "/ingest", Some(&a), heart_rate("HR001", "P001", "2024-01-01T10:00:00", 65)).await;
    post(&h.app, "/ingest", Some(&b), heart_rate("HR002", "P002", "2024-01-01T10:00:00", 99)).await;

    let (_, rows) = get(&h.app, "/readings/hr", &a).await;
    assert_eq!(rows.as_array().unwrap().len(), 1);
    assert_eq!(rows[0]["device_id"], "HR001");

    let (_, rows) = get(&h.app, "/readings/hr?aggregate=max", &a).await;
    assert_eq!(rows.as_array().unwrap().len(), 1);
    assert_eq!(rows[0]["patient_id"], "P001");
    assert_eq!(rows[0]["heart_rate"], 65);
}

#[tokio::test]
async fn concurrent_ingestion_for_two_devices() {
    let h = harness(Policy::default());
    let hr_token = register(&h.app, "HR001", "heart_rate", Some("P001")).await;
    let bp_token = register(&h.app, "BP001", "blood_pressure", Some("P002")).await;

    let now = Utc::now().naive_utc().format("%Y-%m-%dT%H:%M:%S%.f").to_string();
    let (hr, bp) = tokio::join!(
        post(&h.app, "/ingest", Some(&hr_token), heart_rate("HR001", "P001", &now, 75)),
        post(
            &h.app,
            "/ingest",
            Some(&bp_token),
            blood_pressure("BP001", "P002", &now, 120, 80, 72)
        ),
    );
    assert_eq!(hr.0, StatusCode::OK);
    assert_eq!(bp.0, StatusCode::OK);
    assert_ne!(hr.1["id"], bp.1["id"]);
    assert_eq!(h.store.reading_count().unwrap(), 2);
}

#[tokio::test]
async fn concurrent_auto_assign_for_same_patient() {
    let h = harness(Policy::default());
    let token = register(&h.app, "HR001", "heart_rate", None).await;
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let app = h.app.clone();
            let token = token.clone();
            tokio::spawn(async move {
                post(
                    &app,
                    "/ingest",
                    Some(&token),
                    heart_rate("HR001", "P100", "2024-01-01T10:00:00", 60 + i),
                )
                .await
                .0
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap(), StatusCode::OK);
    }
    assert_eq!(h.store.patient_count().unwrap(), 1);
    assert_eq!(h.store.assignment_count().unwrap(), 1);
    assert_eq!(h.store.reading_count().unwrap(), 8);
}

/// Delegates to a `MemoryStore` but fails every heart-rate insert.
struct FailingStore(MemoryStore);

struct FailingSession(Box<dyn Session>);

#[async_trait]
impl Store for FailingStore {
    async fn begin(&self) -> Result<Box<dyn Session>, StoreError> {
        Ok(Box::new(FailingSession(self.0.begin().await?)))
    }

    async fn find_device(&self, device_id: &str) -> Result<Option<Device>, StoreError> {
        self.0.find_device(device_id).await
    }

    async fn assigned_patients(&self, device_id: &str) -> Result<Vec<String>, StoreError> {
        self.0.assigned_patients(device_id).await
    }

    async fn heart_rate_readings(
        &self,
        device_id: &str,
        window: &TimeWindow,
    ) -> Result<Vec<HeartRateReading>, StoreError> {
        self.0.heart_rate_readings(device_id, window).await
    }

    async fn blood_pressure_readings(
        &self,
        device_id: &str,
        window: &TimeWindow,
    ) -> Result<Vec<BloodPressureReading>, StoreError> {
        self.0.blood_pressure_readings(device_id, window).await
    }
}

#[async_trait]
impl Session for FailingSession {
    async fn find_device(&mut self, device_id: &str) -> Result<Option<Device>, StoreError> {
        self.0.find_device(device_id).await
    }
    async fn insert_device(&mut self, device: &Device) -> Result<InsertResult, StoreError> {
        self.0.insert_device(device).await
    }
    async fn find_patient(&mut self, patient_id: &str) -> Result<Option<Patient>, StoreError> {
        self.0.find_patient(patient_id).await
    }
    async fn insert_patient(&mut self, patient: &Patient) -> Result<InsertResult, StoreError> {
        self.0.insert_patient(patient).await
    }
    async fn has_assignment(&mut self, device_id: &str, patient_id: &str) -> Result<bool, StoreError> {
        self.0.has_assignment(device_id, patient_id).await
    }
    async fn insert_assignment(&mut self, assignment: &Assignment) -> Result<InsertResult, StoreError> {
        self.0.insert_assignment(assignment).await
    }
    async fn insert_heart_rate(&mut self, _reading: &NewHeartRate) -> Result<i64, StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
    }
    async fn insert_blood_pressure(&mut self, reading: &NewBloodPressure) -> Result<i64, StoreError> {
        self.0.insert_blood_pressure(reading).await
    }
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.0.commit().await
    }
}

#[tokio::test]
async fn storage_failure_rolls_back_the_whole_call() {
    let memory = MemoryStore::new();
    let app = app_with(Arc::new(FailingStore(memory.clone())), Policy::default());
    let token = register(&app, "HR001", "heart_rate", None).await;
    assert_eq!(memory.patient_count().unwrap(), 0);

    let (status, res) = post(
        &app,
        "/ingest",
        Some(&token),
        heart_rate("HR001", "P555", "2024-01-01T10:00:00", 70),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(res["error"]["code"], "INTERNAL");
    assert_eq!(res["error"]["message"], "An internal error occurred");
    assert_eq!(memory.patient_count().unwrap(), 0);
    assert_eq!(memory.assignment_count().unwrap(), 0);
    assert_eq!(memory.reading_count().unwrap(), 0);

    let (status, _) = post(
        &app,
        "/ingest",
        Some(&token),
        blood_pressure("HR001", "P555", "2024-01-01T10:00:00", 120, 80, 70),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(memory.patient_count().unwrap(), 1);
}
