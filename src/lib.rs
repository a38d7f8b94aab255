//! Device-authenticated ingestion and query API for heart-rate and
//! blood-pressure readings.
//!
//! Devices register for an Ed25519-signed bearer token, post readings for the
//! patients they are bound to, and read back their own readings raw or
//! aggregated per patient. Storage is Postgres (or an in-process store for
//! development), always reached through the [`store::Store`] seam.

pub mod api;
pub mod assignment;
pub mod config;
pub mod credential;
pub mod error;
pub mod ingest;
pub mod model;
pub mod query;
pub mod store;
pub mod timestamp;
pub mod types;

pub use api::{router, AppState};
pub use config::{AssignmentPolicy, Config, Policy, ReregistrationPolicy};
pub use credential::Credentials;
pub use error::ApiError;
