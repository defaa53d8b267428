//! # Google Cloud Healthcare Provider
//!
//! Thin client for the DICOMweb surface of a Cloud Healthcare DICOM store.
//!
//! ## Overview
//!
//! This module provides:
//! - URL construction for stores and studies
//! - Study listing (QIDO-RS JSON, Study Instance UID tag `0020000D`)
//! - Multipart uploads (STOW-RS) with a streamed request body
//! - Study retrieval (WADO-RS) with a streamed response body
//! - Store existence check and creation
//!
//! Every call takes the bearer token explicitly; the session layer decides
//! when to sign in.

pub mod client;
pub mod error;
pub mod types;

pub use client::{HealthcareClient, STOW_ACCEPT, STUDY_ACCEPT};
pub use error::{HealthcareError, Result};
pub use types::RemoteObjectRef;
