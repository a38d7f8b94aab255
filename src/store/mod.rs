// src/store/mod.rs
//! Storage seam for devices, patients, assignments and readings.
//!
//! Writes go through a [`Session`], which is one database transaction:
//! nothing is visible to other requests until [`Session::commit`], and a
//! session dropped without committing is rolled back.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;

use crate::model::{
    Assignment, BloodPressureReading, Device, HeartRateReading, NewBloodPressure, NewHeartRate,
    Patient, TimeWindow,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Outcome of an insert that may lose a uniqueness race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    Inserted,
    /// A row with the same key exists (committed, or inserted by a racing
    /// transaction). Not an error: re-read it.
    AlreadyExists,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Session>>;

    async fn find_device(&self, device_id: &str) -> Result<Option<Device>>;

    /// Patients the device is bound to, ascending by id.
    async fn assigned_patients(&self, device_id: &str) -> Result<Vec<String>>;

    /// Heart-rate rows of one device inside the window, in insertion order.
    async fn heart_rate_readings(
        &self,
        device_id: &str,
        window: &TimeWindow,
    ) -> Result<Vec<HeartRateReading>>;

    async fn blood_pressure_readings(
        &self,
        device_id: &str,
        window: &TimeWindow,
    ) -> Result<Vec<BloodPressureReading>>;
}

#[async_trait]
pub trait Session: Send {
    async fn find_device(&mut self, device_id: &str) -> Result<Option<Device>>;
    async fn insert_device(&mut self, device: &Device) -> Result<InsertResult>;

    async fn find_patient(&mut self, patient_id: &str) -> Result<Option<Patient>>;
    async fn insert_patient(&mut self, patient: &Patient) -> Result<InsertResult>;

    async fn has_assignment(&mut self, device_id: &str, patient_id: &str) -> Result<bool>;
    async fn insert_assignment(&mut self, assignment: &Assignment) -> Result<InsertResult>;

    /// Returns the new row id.
    async fn insert_heart_rate(&mut self, reading: &NewHeartRate) -> Result<i64>;
    async fn insert_blood_pressure(&mut self, reading: &NewBloodPressure) -> Result<i64>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Open the store named by `url`: `memory:` or a Postgres connection string.
pub async fn connect(url: &str, max_connections: u32) -> Result<std::sync::Arc<dyn Store>> {
    if url == "memory:" || url == "memory://" {
        tracing::warn!("using in-memory store, data is lost on exit");
        return Ok(std::sync::Arc::new(MemoryStore::new()));
    }
    let store = PgStore::connect(url, max_connections).await?;
    store.init_schema().await?;
    Ok(std::sync::Arc::new(store))
}
