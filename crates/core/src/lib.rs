//! `waybill-core`: model building blocks for the offline sync client.
//!
//! This crate contains **pure** types (no IO): cached entity snapshots,
//! pending mutation records and the identifiers that tie them together.

pub mod entity;
pub mod error;
pub mod id;
pub mod operation;

pub use entity::{CachedEntity, EntityType, server_id_of};
pub use error::{ModelError, ModelResult};
pub use id::{QueueId, TempId};
pub use operation::{HttpMethod, OperationStatus, OperationType, PendingOperation};
