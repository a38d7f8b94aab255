// src/model.rs
use chrono::NaiveDateTime;
use serde::Serialize;
use sqlx::FromRow;

pub const DEFAULT_PATIENT_NAME: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct Device {
    pub device_id: String,
    pub device_type: String,
    pub registered_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct Patient {
    pub patient_id: String,
    pub name: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Assignment {
    pub device_id: String,
    pub patient_id: String,
    pub assigned_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct HeartRateReading {
    pub id: i64,
    pub device_id: String,
    pub patient_id: String,
    pub timestamp: NaiveDateTime,
    pub heart_rate: i32,
    pub quality: String,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct BloodPressureReading {
    pub id: i64,
    pub device_id: String,
    pub patient_id: String,
    pub timestamp: NaiveDateTime,
    pub systolic: i32,
    pub diastolic: i32,
    pub pulse: i32,
    /// Set only on aggregate records.
    #[sqlx(skip)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// A heart-rate row before the store assigns its id.
#[derive(Debug, Clone)]
pub struct NewHeartRate {
    pub device_id: String,
    pub patient_id: String,
    pub timestamp: NaiveDateTime,
    pub heart_rate: i32,
    pub quality: String,
}

#[derive(Debug, Clone)]
pub struct NewBloodPressure {
    pub device_id: String,
    pub patient_id: String,
    pub timestamp: NaiveDateTime,
    pub systolic: i32,
    pub diastolic: i32,
    pub pulse: i32,
}

/// Inclusive time bounds on stored timestamps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeWindow {
    pub from: Option<NaiveDateTime>,
    pub to: Option<NaiveDateTime>,
}

impl TimeWindow {
    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        self.from.map_or(true, |from| ts >= from) && self.to.map_or(true, |to| ts <= to)
    }
}
