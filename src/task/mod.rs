//! Task data model.

pub mod model;

pub use model::{
    ExtractedFields, Format, HistoryEntry, Intent, TaskError, TaskRecord, TaskStatus,
};
