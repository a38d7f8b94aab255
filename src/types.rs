// src/types.rs
use chrono::NaiveDateTime;
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::timestamp;

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterReq {
    pub device_id: String,
    pub device_type: String,
    #[serde(default)]
    pub patient_id: Option<String>,
    #[serde(default)]
    pub patient_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenRes {
    pub access_token: String,
    pub token_type: String,
}

impl TokenRes {
    pub fn bearer(access_token: String) -> Self {
        Self {
            access_token,
            token_type: "bearer".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartRateInput {
    pub device_id: String,
    pub patient_id: String,
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub timestamp: NaiveDateTime,
    pub heart_rate: i32,
    pub measurement_quality: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BloodPressureInput {
    pub device_id: String,
    pub patient_id: String,
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub timestamp: NaiveDateTime,
    pub systolic: i32,
    pub diastolic: i32,
    pub pulse: i32,
}

/// `/ingest` body. An explicit `type` (`heart_rate` | `blood_pressure`) wins;
/// without one the kind follows from the measurement fields present.
#[derive(Debug, Clone)]
pub enum ReadingInput {
    HeartRate(HeartRateInput),
    BloodPressure(BloodPressureInput),
}

const READING_KINDS: &[&str] = &["heart_rate", "blood_pressure"];
const BLOOD_PRESSURE_FIELDS: [&str; 3] = ["systolic", "diastolic", "pulse"];

impl<'de> Deserialize<'de> for ReadingInput {
    fn deserialize<D>(d: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let body = Map::<String, Value>::deserialize(d)?;
        let is_heart_rate = match body.get("type") {
            Some(Value::String(kind)) if kind == "heart_rate" => true,
            Some(Value::String(kind)) if kind == "blood_pressure" => false,
            Some(Value::String(kind)) => return Err(de::Error::unknown_variant(kind, READING_KINDS)),
            Some(Value::Null) | None => {
                let has_hr = body.contains_key("heart_rate");
                let has_bp = BLOOD_PRESSURE_FIELDS.iter().any(|f| body.contains_key(*f));
                match (has_hr, has_bp) {
                    (true, false) => true,
                    (false, true) => false,
                    _ => {
                        return Err(de::Error::custom(
                            "cannot infer reading kind: send heart_rate or systolic/diastolic/pulse, or set type",
                        ))
                    }
                }
            }
            Some(other) => return Err(de::Error::custom(format!("type must be a string, got {other}"))),
        };
        let body = Value::Object(body);
        if is_heart_rate {
            serde_json::from_value(body)
                .map(ReadingInput::HeartRate)
                .map_err(de::Error::custom)
        } else {
            serde_json::from_value(body)
                .map(ReadingInput::BloodPressure)
                .map_err(de::Error::custom)
        }
    }
}

impl ReadingInput {
    pub fn device_id(&self) -> &str {
        match self {
            ReadingInput::HeartRate(r) => &r.device_id,
            ReadingInput::BloodPressure(r) => &r.device_id,
        }
    }

    pub fn patient_id(&self) -> &str {
        match self {
            ReadingInput::HeartRate(r) => &r.patient_id,
            ReadingInput::BloodPressure(r) => &r.patient_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ReadingInput::HeartRate(_) => "heart_rate",
            ReadingInput::BloodPressure(_) => "blood_pressure",
        }
    }

    /// Field constraints checked before any write.
    pub fn validate(&self) -> Result<(), String> {
        if self.patient_id().trim().is_empty() {
            return Err("patient_id must not be empty".into());
        }
        match self {
            ReadingInput::HeartRate(r) if r.heart_rate <= 0 => {
                Err(format!("heart_rate must be > 0, got {}", r.heart_rate))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestRes {
    pub status: String,
    pub id: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReadingsParams {
    #[serde(default, deserialize_with = "timestamp::deserialize_opt")]
    pub from_time: Option<NaiveDateTime>,
    #[serde(default, deserialize_with = "timestamp::deserialize_opt")]
    pub to_time: Option<NaiveDateTime>,
    #[serde(default)]
    pub aggregate: Option<String>,
}
