//! Bulk warm-up of destinations before incremental replication.
//!
//! [`plan`] decides which streams are copied in bulk, [`pool`] runs the copies table by table
//! and merges the resulting positions into the pipeline checkpoint, [`bulk`] abstracts the
//! copy itself.

pub mod bulk;
pub mod plan;
pub mod pool;

pub use bulk::{BulkTransfer, BulkTransferRequest, CommandBulkTransfer};
pub use plan::{FastSyncPlan, ResyncRequest, is_applicable, plan};
pub use pool::{FastSyncContext, FastSyncReport, TableOutcome, TableStatus, run_fastsync};
