//! Notion integration: API client, block rendering, markdown conversion and
//! the sync worker.

pub mod blocks;
pub mod client;
pub mod render;
pub mod sync;

pub use client::{Block, HttpNotionClient, NotionApi, NotionPageRef, PageBatch, PageMeta};
pub use sync::{NotionSyncReport, NotionSyncWorker, SyncMode};
