//! # Transfer Pipelines
//!
//! Moves DICOM objects between a local pipeline and a cloud DICOM store.
//!
//! - [`ExportService`]: unbounded submission queue drained by a fixed worker
//!   pool that uploads each file as a one-part `multipart/related` body.
//! - [`ImportService`]: interval poller that lists the store and downloads new
//!   studies through a fixed worker pool.
//! - [`TransferStatusSink`]: latest outcome per file or study.
//! - [`multipart`]: streaming encoder and decoder used by both pipelines.
//!
//! Both pipelines depend on an [`AccessTokenProvider`](core_auth::AccessTokenProvider)
//! rather than on a session directly, so one signed-in session can be shared.

pub mod error;
pub mod export;
pub mod import;
pub mod multipart;
pub mod status;

pub use error::{Result, TransferError};
pub use export::{ExportService, ExportSettings, TaskState, TransferTask};
pub use import::{FileReceiver, ImportService, ImportSettings, PollerState};
pub use multipart::{MultipartEncoder, MultipartMessage, MultipartPart, MultipartReader, PartHeaders};
pub use status::{
    Direction, OutcomeCounts, OutcomeStatus, StatusReport, TransferOutcome, TransferStatusSink,
};
