// src/assignment.rs
//! Lookup-or-create for devices, patients and their bindings.
//!
//! Every `ensure_*` runs inside the caller's session. An insert that loses a
//! uniqueness race reports `AlreadyExists` and is resolved by re-reading the
//! winner's row.

use tracing::{debug, info};

use crate::config::ReregistrationPolicy;
use crate::error::ApiError;
use crate::model::{Assignment, Device, Patient, DEFAULT_PATIENT_NAME};
use crate::store::{InsertResult, Result, Session, Store, StoreError};
use crate::timestamp;
use crate::types::RegisterReq;

pub async fn ensure_device(
    session: &mut dyn Session,
    device_id: &str,
    device_type: &str,
) -> Result<Device> {
    if let Some(device) = session.find_device(device_id).await? {
        return Ok(device);
    }
    let device = Device {
        device_id: device_id.to_string(),
        device_type: device_type.to_string(),
        registered_at: timestamp::now(),
    };
    match session.insert_device(&device).await? {
        InsertResult::Inserted => {
            info!(device_id, device_type, "device created");
            Ok(device)
        }
        InsertResult::AlreadyExists => reread(session.find_device(device_id).await?, "device"),
    }
}

pub async fn ensure_patient(
    session: &mut dyn Session,
    patient_id: &str,
    name: Option<&str>,
) -> Result<Patient> {
    if let Some(patient) = session.find_patient(patient_id).await? {
        return Ok(patient);
    }
    let patient = Patient {
        patient_id: patient_id.to_string(),
        name: name.unwrap_or(DEFAULT_PATIENT_NAME).to_string(),
        created_at: timestamp::now(),
    };
    match session.insert_patient(&patient).await? {
        InsertResult::Inserted => {
            info!(patient_id, "patient created");
            Ok(patient)
        }
        InsertResult::AlreadyExists => reread(session.find_patient(patient_id).await?, "patient"),
    }
}

/// Idempotent: binding an already bound pair is a no-op.
pub async fn ensure_assignment(
    session: &mut dyn Session,
    device_id: &str,
    patient_id: &str,
) -> Result<()> {
    if session.has_assignment(device_id, patient_id).await? {
        return Ok(());
    }
    let assignment = Assignment {
        device_id: device_id.to_string(),
        patient_id: patient_id.to_string(),
        assigned_at: timestamp::now(),
    };
    if session.insert_assignment(&assignment).await? == InsertResult::Inserted {
        info!(device_id, patient_id, "device assigned to patient");
    } else {
        debug!(device_id, patient_id, "assignment created concurrently");
    }
    Ok(())
}

pub async fn is_assigned(session: &mut dyn Session, device_id: &str, patient_id: &str) -> Result<bool> {
    session.has_assignment(device_id, patient_id).await
}

fn reread<T>(row: Option<T>, what: &str) -> Result<T> {
    row.ok_or_else(|| StoreError::Unavailable(format!("{what} vanished after conflicting insert")))
}

/// Registration write sequence, committed as one transaction.
///
/// With `patient_id` the device is bound to that patient regardless of the
/// ingestion assignment policy.
pub async fn enroll(
    store: &dyn Store,
    req: &RegisterReq,
    policy: ReregistrationPolicy,
) -> std::result::Result<Device, ApiError> {
    if req.device_id.trim().is_empty() {
        return Err(ApiError::Validation("device_id must not be empty".into()));
    }
    if req.device_type.trim().is_empty() {
        return Err(ApiError::Validation("device_type must not be empty".into()));
    }
    if matches!(req.patient_id.as_deref(), Some(p) if p.trim().is_empty()) {
        return Err(ApiError::Validation("patient_id must not be empty".into()));
    }

    let mut session = store.begin().await?;

    let device = match policy {
        ReregistrationPolicy::Reissue => {
            ensure_device(session.as_mut(), &req.device_id, &req.device_type).await?
        }
        ReregistrationPolicy::Reject => {
            let device = Device {
                device_id: req.device_id.clone(),
                device_type: req.device_type.clone(),
                registered_at: timestamp::now(),
            };
            // Covers both a committed row and a racing registration.
            if session.find_device(&req.device_id).await?.is_some()
                || session.insert_device(&device).await? == InsertResult::AlreadyExists
            {
                return Err(ApiError::DeviceExists(req.device_id.clone()));
            }
            info!(device_id = %device.device_id, device_type = %device.device_type, "device created");
            device
        }
    };

    if let Some(patient_id) = req.patient_id.as_deref() {
        ensure_patient(session.as_mut(), patient_id, req.patient_name.as_deref()).await?;
        ensure_assignment(session.as_mut(), &device.device_id, patient_id).await?;
    }

    session.commit().await?;
    Ok(device)
}
