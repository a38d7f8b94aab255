// src/ingest.rs
//! Ingestion gate.
//!
//! A reading is accepted only after the token subject matches the payload
//! device, the payload passes field checks, and the (device, patient) pair is
//! bound. Patient, assignment and reading are written in one session, so a
//! failure at any step leaves nothing behind.

use tracing::{info, warn};

use crate::assignment::{ensure_assignment, ensure_patient, is_assigned};
use crate::config::AssignmentPolicy;
use crate::error::{ApiError, AuthFailure};
use crate::model::{NewBloodPressure, NewHeartRate};
use crate::store::Store;
use crate::timestamp;
use crate::types::ReadingInput;

pub async fn ingest(
    store: &dyn Store,
    policy: AssignmentPolicy,
    authenticated_device: &str,
    reading: &ReadingInput,
) -> Result<i64, ApiError> {
    let device_id = reading.device_id();
    let patient_id = reading.patient_id();

    if device_id != authenticated_device {
        warn!(token_subject = authenticated_device, payload_device = device_id, "device id mismatch");
        return Err(ApiError::IdentityMismatch);
    }
    reading.validate().map_err(ApiError::Validation)?;

    let mut session = store.begin().await?;

    if session.find_device(device_id).await?.is_none() {
        return Err(ApiError::Unauthenticated(AuthFailure::UnknownDevice));
    }

    ensure_patient(session.as_mut(), patient_id, None).await?;

    if !is_assigned(session.as_mut(), device_id, patient_id).await? {
        match policy {
            AssignmentPolicy::Strict => {
                return Err(ApiError::NotAssigned {
                    device_id: device_id.to_string(),
                    patient_id: patient_id.to_string(),
                })
            }
            AssignmentPolicy::AutoAssign => {
                ensure_assignment(session.as_mut(), device_id, patient_id).await?
            }
        }
    }

    let id = match reading {
        ReadingInput::HeartRate(r) => {
            session
                .insert_heart_rate(&NewHeartRate {
                    device_id: r.device_id.clone(),
                    patient_id: r.patient_id.clone(),
                    timestamp: timestamp::truncate(r.timestamp),
                    heart_rate: r.heart_rate,
                    quality: r.measurement_quality.clone(),
                })
                .await?
        }
        ReadingInput::BloodPressure(r) => {
            session
                .insert_blood_pressure(&NewBloodPressure {
                    device_id: r.device_id.clone(),
                    patient_id: r.patient_id.clone(),
                    timestamp: timestamp::truncate(r.timestamp),
                    systolic: r.systolic,
                    diastolic: r.diastolic,
                    pulse: r.pulse,
                })
                .await?
        }
    };

    session.commit().await?;
    info!(device_id, patient_id, kind = reading.kind(), id, "reading stored");
    Ok(id)
}
