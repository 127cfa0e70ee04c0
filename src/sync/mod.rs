//! # Sync Module
//!
//! Ships locally captured records to a remote collector.
//!
//! This module handles:
//! - Reading records from the local store ([`RecordStore`], [`JsonlRecordStore`])
//! - Packaging and uploading batches ([`UploadTransport`], [`HttpUploader`])
//! - Bounded retries with a per-attempt timeout ([`SyncManager`])
//! - Durable per-source progress cursors ([`CursorStore`])
//!
//! Delivery is at-least-once.

pub mod cursor;
pub mod manager;
pub mod record;
pub mod transport;

pub use cursor::{CursorStore, SyncCursor};
pub use manager::{SyncManager, SyncOptions, SyncOutcome};
pub use record::{JsonlRecordStore, Record, RecordStore};
pub use transport::{HttpUploader, UploadBatch, UploadReceipt, UploadTransport};
