// src/store/postgres.rs
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};
use tracing::info;

use super::{InsertResult, Result, Session, Store};
use crate::model::{
    Assignment, BloodPressureReading, Device, HeartRateReading, NewBloodPressure, NewHeartRate,
    Patient, TimeWindow,
};

const SCHEMA: &str = include_str!("../../schema.sql");

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Create missing tables. Safe to run on every start.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("schema ready");
        Ok(())
    }
}

fn inserted(rows_affected: u64) -> InsertResult {
    if rows_affected == 0 {
        InsertResult::AlreadyExists
    } else {
        InsertResult::Inserted
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn Session>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgSession { tx }))
    }

    async fn find_device(&self, device_id: &str) -> Result<Option<Device>> {
        let device = sqlx::query_as::<_, Device>(
            "SELECT device_id, device_type, registered_at FROM device WHERE device_id=$1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(device)
    }

    async fn assigned_patients(&self, device_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT patient_id FROM device_patient_assignment WHERE device_id=$1 ORDER BY patient_id",
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get("patient_id")).collect())
    }

    async fn heart_rate_readings(
        &self,
        device_id: &str,
        window: &TimeWindow,
    ) -> Result<Vec<HeartRateReading>> {
        let rows = sqlx::query_as::<_, HeartRateReading>(
            r#"
            SELECT id, device_id, patient_id, timestamp, heart_rate, quality
            FROM heart_rate
            WHERE device_id=$1
              AND ($2::timestamp IS NULL OR timestamp >= $2)
              AND ($3::timestamp IS NULL OR timestamp <= $3)
            ORDER BY id
            "#,
        )
        .bind(device_id)
        .bind(window.from)
        .bind(window.to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn blood_pressure_readings(
        &self,
        device_id: &str,
        window: &TimeWindow,
    ) -> Result<Vec<BloodPressureReading>> {
        let rows = sqlx::query_as::<_, BloodPressureReading>(
            r#"
            SELECT id, device_id, patient_id, timestamp, systolic, diastolic, pulse
            FROM blood_pressure
            WHERE device_id=$1
              AND ($2::timestamp IS NULL OR timestamp >= $2)
              AND ($3::timestamp IS NULL OR timestamp <= $3)
            ORDER BY id
            "#,
        )
        .bind(device_id)
        .bind(window.from)
        .bind(window.to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

pub struct PgSession {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl Session for PgSession {
    async fn find_device(&mut self, device_id: &str) -> Result<Option<Device>> {
        let device = sqlx::query_as::<_, Device>(
            "SELECT device_id, device_type, registered_at FROM device WHERE device_id=$1",
        )
        .bind(device_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(device)
    }

    async fn insert_device(&mut self, device: &Device) -> Result<InsertResult> {
        let res = sqlx::query(
            "INSERT INTO device (device_id, device_type, registered_at) VALUES ($1,$2,$3)
             ON CONFLICT (device_id) DO NOTHING",
        )
        .bind(&device.device_id)
        .bind(&device.device_type)
        .bind(device.registered_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(inserted(res.rows_affected()))
    }

    async fn find_patient(&mut self, patient_id: &str) -> Result<Option<Patient>> {
        let patient = sqlx::query_as::<_, Patient>(
            "SELECT patient_id, name, created_at FROM patient WHERE patient_id=$1",
        )
        .bind(patient_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(patient)
    }

    async fn insert_patient(&mut self, patient: &Patient) -> Result<InsertResult> {
        let res = sqlx::query(
            "INSERT INTO patient (patient_id, name, created_at) VALUES ($1,$2,$3)
             ON CONFLICT (patient_id) DO NOTHING",
        )
        .bind(&patient.patient_id)
        .bind(&patient.name)
        .bind(patient.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(inserted(res.rows_affected()))
    }

    async fn has_assignment(&mut self, device_id: &str, patient_id: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 AS found FROM device_patient_assignment WHERE device_id=$1 AND patient_id=$2",
        )
        .bind(device_id)
        .bind(patient_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.is_some())
    }

    async fn insert_assignment(&mut self, assignment: &Assignment) -> Result<InsertResult> {
        let res = sqlx::query(
            "INSERT INTO device_patient_assignment (device_id, patient_id, assigned_at) VALUES ($1,$2,$3)
             ON CONFLICT (device_id, patient_id) DO NOTHING",
        )
        .bind(&assignment.device_id)
        .bind(&assignment.patient_id)
        .bind(assignment.assigned_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(inserted(res.rows_affected()))
    }

    async fn insert_heart_rate(&mut self, reading: &NewHeartRate) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO heart_rate (device_id, patient_id, timestamp, heart_rate, quality)
             VALUES ($1,$2,$3,$4,$5) RETURNING id",
        )
        .bind(&reading.device_id)
        .bind(&reading.patient_id)
        .bind(reading.timestamp)
        .bind(reading.heart_rate)
        .bind(&reading.quality)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row.get("id"))
    }

    async fn insert_blood_pressure(&mut self, reading: &NewBloodPressure) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO blood_pressure (device_id, patient_id, timestamp, systolic, diastolic, pulse)
             VALUES ($1,$2,$3,$4,$5,$6) RETURNING id",
        )
        .bind(&reading.device_id)
        .bind(&reading.patient_id)
        .bind(reading.timestamp)
        .bind(reading.systolic)
        .bind(reading.diastolic)
        .bind(reading.pulse)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row.get("id"))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
