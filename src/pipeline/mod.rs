//! Document routing pipeline.
//!
//! Every submission flows through:
//! 1. `Router::submit()`: persist a Received record and queue it
//! 2. `Classifier::classify()`: oracle labels, vocabulary checks, threshold
//! 3. `CapabilityRegistry::resolve()`: pick a handler for (format, intent)
//! 4. `Handler::process()`: extract fields under a timeout
//!
//! Each step is recorded in the task's append-only history.

pub mod classifier;
pub mod registry;
pub mod router;
pub mod rules;
pub mod types;
pub mod worker;

pub use classifier::{Classifier, InferenceOracle};
pub use registry::{Capability, CapabilityRegistry, RegistryBuilder, SharedRegistry};
pub use router::{Router, RunOutcome, TaskRunner};
pub use rules::RuleOracle;
pub use types::{Classification, DeclaredMetadata, OracleVerdict, RawInput, SubmitOptions};
pub use worker::{Job, WorkerPool};
