// src/query.rs
//! Raw and aggregated reading queries.
//!
//! Aggregates are computed per patient over the device's own rows. The
//! groups are the device's assigned patients plus any patient that appears in
//! its rows, so a bound patient with nothing in the window still gets a
//! record, with every field `0`.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::NaiveDateTime;

use crate::model::{BloodPressureReading, HeartRateReading, TimeWindow};
use crate::store::{Result, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Min,
    Max,
    Avg,
}

impl Aggregate {
    pub fn as_str(self) -> &'static str {
        match self {
            Aggregate::Min => "min",
            Aggregate::Max => "max",
            Aggregate::Avg => "avg",
        }
    }

    /// `0` for an empty slice.
    pub fn apply(self, values: &[i32]) -> i32 {
        if values.is_empty() {
            return 0;
        }
        match self {
            Aggregate::Min => values.iter().copied().min().unwrap_or(0),
            Aggregate::Max => values.iter().copied().max().unwrap_or(0),
            Aggregate::Avg => {
                let sum: i64 = values.iter().map(|&v| i64::from(v)).sum();
                round_half_up(sum, values.len() as i64)
            }
        }
    }
}

impl FromStr for Aggregate {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "min" => Ok(Aggregate::Min),
            "max" => Ok(Aggregate::Max),
            "avg" => Ok(Aggregate::Avg),
            other => Err(format!("unknown aggregate {other:?}")),
        }
    }
}

/// `floor(sum / n + 0.5)`: halves round toward positive infinity.
fn round_half_up(sum: i64, n: i64) -> i32 {
    (2 * sum + n).div_euclid(2 * n) as i32
}

fn groups<'a, T>(
    patients: &[String],
    rows: &'a [T],
    patient_of: impl Fn(&T) -> &str,
) -> BTreeMap<String, Vec<&'a T>> {
    let mut groups: BTreeMap<String, Vec<&T>> =
        patients.iter().map(|p| (p.clone(), Vec::new())).collect();
    for row in rows {
        groups.entry(patient_of(row).to_string()).or_default().push(row);
    }
    groups
}

pub fn aggregate_heart_rate(
    device_id: &str,
    patients: &[String],
    rows: &[HeartRateReading],
    aggregate: Aggregate,
    at: NaiveDateTime,
) -> Vec<HeartRateReading> {
    groups(patients, rows, |r| r.patient_id.as_str())
        .into_iter()
        .map(|(patient_id, group)| {
            let values: Vec<i32> = group.iter().map(|r| r.heart_rate).collect();
            HeartRateReading {
                id: 0,
                device_id: device_id.to_string(),
                patient_id,
                timestamp: at,
                heart_rate: aggregate.apply(&values),
                quality: aggregate.as_str().to_string(),
            }
        })
        .collect()
}

pub fn aggregate_blood_pressure(
    device_id: &str,
    patients: &[String],
    rows: &[BloodPressureReading],
    aggregate: Aggregate,
    at: NaiveDateTime,
) -> Vec<BloodPressureReading> {
    groups(patients, rows, |r| r.patient_id.as_str())
        .into_iter()
        .map(|(patient_id, group)| {
            let field = |f: fn(&BloodPressureReading) -> i32| {
                aggregate.apply(&group.iter().map(|r| f(r)).collect::<Vec<_>>())
            };
            BloodPressureReading {
                id: 0,
                device_id: device_id.to_string(),
                patient_id,
                timestamp: at,
                systolic: field(|r| r.systolic),
                diastolic: field(|r| r.diastolic),
                pulse: field(|r| r.pulse),
                label: Some(aggregate.as_str().to_string()),
            }
        })
        .collect()
}

pub async fn heart_rate(
    store: &dyn Store,
    device_id: &str,
    window: TimeWindow,
    aggregate: Option<Aggregate>,
    now: NaiveDateTime,
) -> Result<Vec<HeartRateReading>> {
    let rows = store.heart_rate_readings(device_id, &window).await?;
    let Some(aggregate) = aggregate else {
        return Ok(rows);
    };
    let patients = store.assigned_patients(device_id).await?;
    Ok(aggregate_heart_rate(
        device_id,
        &patients,
        &rows,
        aggregate,
        window.to.unwrap_or(now),
    ))
}

pub async fn blood_pressure(
    store: &dyn Store,
    device_id: &str,
    window: TimeWindow,
    aggregate: Option<Aggregate>,
    now: NaiveDateTime,
) -> Result<Vec<BloodPressureReading>> {
    let rows = store.blood_pressure_readings(device_id, &window).await?;
    let Some(aggregate) = aggregate else {
        return Ok(rows);
    };
    let patients = store.assigned_patients(device_id).await?;
    Ok(aggregate_blood_pressure(
        device_id,
        &patients,
        &rows,
        aggregate,
        window.to.unwrap_or(now),
    ))
}
