// src/store/memory.rs
//! In-process store with the same transactional semantics as Postgres.
//!
//! Each session buffers its writes and applies them under the table lock at
//! commit. Keyed inserts behave like `ON CONFLICT DO NOTHING`. The lock is
//! never held across an await.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{InsertResult, Result, Session, Store, StoreError};
use crate::model::{
    Assignment, BloodPressureReading, Device, HeartRateReading, NewBloodPressure, NewHeartRate,
    Patient, TimeWindow,
};

#[derive(Default)]
struct Tables {
    devices: BTreeMap<String, Device>,
    patients: BTreeMap<String, Patient>,
    assignments: BTreeMap<(String, String), Assignment>,
    heart_rate: Vec<HeartRateReading>,
    blood_pressure: Vec<BloodPressureReading>,
}

struct Shared {
    tables: Mutex<Tables>,
    next_id: AtomicI64,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                next_id: AtomicI64::new(1),
            }),
        }
    }

    pub fn device_count(&self) -> Result<usize> {
        Ok(self.shared.lock()?.devices.len())
    }

    pub fn patient_count(&self) -> Result<usize> {
        Ok(self.shared.lock()?.patients.len())
    }

    pub fn assignment_count(&self) -> Result<usize> {
        Ok(self.shared.lock()?.assignments.len())
    }

    pub fn reading_count(&self) -> Result<usize> {
        let tables = self.shared.lock()?;
        Ok(tables.heart_rate.len() + tables.blood_pressure.len())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Session>> {
        Ok(Box::new(MemorySession {
            shared: self.shared.clone(),
            pending: Tables::default(),
        }))
    }

    async fn find_device(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(self.shared.lock()?.devices.get(device_id).cloned())
    }

    async fn assigned_patients(&self, device_id: &str) -> Result<Vec<String>> {
        let tables = self.shared.lock()?;
        Ok(tables
            .assignments
            .keys()
            .filter(|(d, _)| d == device_id)
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn heart_rate_readings(
        &self,
        device_id: &str,
        window: &TimeWindow,
    ) -> Result<Vec<HeartRateReading>> {
        let tables = self.shared.lock()?;
        let mut rows: Vec<_> = tables
            .heart_rate
            .iter()
            .filter(|r| r.device_id == device_id && window.contains(r.timestamp))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }

    async fn blood_pressure_readings(
        &self,
        device_id: &str,
        window: &TimeWindow,
    ) -> Result<Vec<BloodPressureReading>> {
        let tables = self.shared.lock()?;
        let mut rows: Vec<_> = tables
            .blood_pressure
            .iter()
            .filter(|r| r.device_id == device_id && window.contains(r.timestamp))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }
}

struct MemorySession {
    shared: Arc<Shared>,
    pending: Tables,
}

impl MemorySession {
    fn assignment_visible(&self, device_id: &str, patient_id: &str) -> Result<bool> {
        let key = (device_id.to_string(), patient_id.to_string());
        Ok(self.pending.assignments.contains_key(&key)
            || self.shared.lock()?.assignments.contains_key(&key))
    }

    fn require_assignment(&self, device_id: &str, patient_id: &str) -> Result<()> {
        if self.assignment_visible(device_id, patient_id)? {
            Ok(())
        } else {
            Err(StoreError::Constraint(format!(
                "no assignment for ({device_id}, {patient_id})"
            )))
        }
    }

    fn next_id(&self) -> i64 {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn find_device(&mut self, device_id: &str) -> Result<Option<Device>> {
        if let Some(device) = self.pending.devices.get(device_id) {
            return Ok(Some(device.clone()));
        }
        Ok(self.shared.lock()?.devices.get(device_id).cloned())
    }

    async fn insert_device(&mut self, device: &Device) -> Result<InsertResult> {
        if self.find_device(&device.device_id).await?.is_some() {
            return Ok(InsertResult::AlreadyExists);
        }
        self.pending
            .devices
            .insert(device.device_id.clone(), device.clone());
        Ok(InsertResult::Inserted)
    }

    async fn find_patient(&mut self, patient_id: &str) -> Result<Option<Patient>> {
        if let Some(patient) = self.pending.patients.get(patient_id) {
            return Ok(Some(patient.clone()));
        }
        Ok(self.shared.lock()?.patients.get(patient_id).cloned())
    }

    async fn insert_patient(&mut self, patient: &Patient) -> Result<InsertResult> {
        if self.find_patient(&patient.patient_id).await?.is_some() {
            return Ok(InsertResult::AlreadyExists);
        }
        self.pending
            .patients
            .insert(patient.patient_id.clone(), patient.clone());
        Ok(InsertResult::Inserted)
    }

    async fn has_assignment(&mut self, device_id: &str, patient_id: &str) -> Result<bool> {
        self.assignment_visible(device_id, patient_id)
    }

    async fn insert_assignment(&mut self, assignment: &Assignment) -> Result<InsertResult> {
        if self.assignment_visible(&assignment.device_id, &assignment.patient_id)? {
            return Ok(InsertResult::AlreadyExists);
        }
        if self.find_device(&assignment.device_id).await?.is_none()
            || self.find_patient(&assignment.patient_id).await?.is_none()
        {
            return Err(StoreError::Constraint(format!(
                "assignment references unknown device {} or patient {}",
                assignment.device_id, assignment.patient_id
            )));
        }
        self.pending.assignments.insert(
            (assignment.device_id.clone(), assignment.patient_id.clone()),
            assignment.clone(),
        );
        Ok(InsertResult::Inserted)
    }

    async fn insert_heart_rate(&mut self, reading: &NewHeartRate) -> Result<i64> {
        self.require_assignment(&reading.device_id, &reading.patient_id)?;
        if reading.heart_rate <= 0 {
            return Err(StoreError::Constraint("heart_rate must be positive".into()));
        }
        let id = self.next_id();
        self.pending.heart_rate.push(HeartRateReading {
            id,
            device_id: reading.device_id.clone(),
            patient_id: reading.patient_id.clone(),
            timestamp: reading.timestamp,
            heart_rate: reading.heart_rate,
            quality: reading.quality.clone(),
        });
        Ok(id)
    }

    async fn insert_blood_pressure(&mut self, reading: &NewBloodPressure) -> Result<i64> {
        self.require_assignment(&reading.device_id, &reading.patient_id)?;
        let id = self.next_id();
        self.pending.blood_pressure.push(BloodPressureReading {
            id,
            device_id: reading.device_id.clone(),
            patient_id: reading.patient_id.clone(),
            timestamp: reading.timestamp,
            systolic: reading.systolic,
            diastolic: reading.diastolic,
            pulse: reading.pulse,
            label: None,
        });
        Ok(id)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemorySession { shared, pending } = *self;
        let mut tables = shared.lock()?;
        for (id, device) in pending.devices {
            tables.devices.entry(id).or_insert(device);
        }
        for (id, patient) in pending.patients {
            tables.patients.entry(id).or_insert(patient);
        }
        for (key, assignment) in pending.assignments {
            tables.assignments.entry(key).or_insert(assignment);
        }
        tables.heart_rate.extend(pending.heart_rate);
        tables.blood_pressure.extend(pending.blood_pressure);
        Ok(())
    }
}
