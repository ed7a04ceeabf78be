//! Google Drive integration: API client, artifact extraction and the
//! changes-driven sync worker.

pub mod client;
pub mod extract;
pub mod sync;

pub use client::{ChangePage, DriveApi, DriveFileMeta, HttpDriveClient, RawChange};
pub use sync::{DriveSyncReport, DriveSyncWorker};
