//! doc-router: classify inbound documents, route them to extraction
//! handlers, and track every task in a shared correlation store.

pub mod api;
pub mod config;
pub mod error;
pub mod handlers;
pub mod llm;
pub mod pipeline;
pub mod status;
pub mod store;
pub mod task;
