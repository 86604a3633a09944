//! Capability registry: maps (format, intent) to a handler.
//!
//! Lookup order is exact (format, intent), then (format, any intent), then
//! the default handler. A registry is immutable once built; `SharedRegistry`
//! swaps whole snapshots for hot reload.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::handlers::{CorrespondenceHandler, DocumentHandler, Handler, StructuredDataHandler};
use crate::task::model::{Format, Intent};

/// What a handler declares it can process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Exact(Format, Intent),
    AnyIntent(Format),
}

/// Immutable handler lookup table.
pub struct CapabilityRegistry {
    exact: HashMap<(Format, Intent), Arc<dyn Handler>>,
    by_format: HashMap<Format, Arc<dyn Handler>>,
    default: Option<Arc<dyn Handler>>,
}

impl CapabilityRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// An empty registry: every lookup fails.
    pub fn empty() -> Self {
        Self::builder().build()
    }

    /// The standard handler set. `DocumentHandler` doubles as the default.
    pub fn standard() -> Self {
        let document: Arc<dyn Handler> = Arc::new(DocumentHandler::new());
        Self::builder()
            .register(
                Capability::AnyIntent(Format::StructuredData),
                Arc::new(StructuredDataHandler::new()),
            )
            .register(
                Capability::AnyIntent(Format::Correspondence),
                Arc::new(CorrespondenceHandler::new()),
            )
            .register(Capability::AnyIntent(Format::Document), document.clone())
            .default_handler(document)
            .build()
    }

    /// Resolve the handler for a classification, or `None` when nothing fits.
    pub fn resolve(&self, format: Format, intent: Intent) -> Option<Arc<dyn Handler>> {
        self.exact
            .get(&(format, intent))
            .or_else(|| self.by_format.get(&format))
            .or(self.default.as_ref())
            .cloned()
    }

    /// Number of registered capabilities, excluding the default.
    pub fn len(&self) -> usize {
        self.exact.len() + self.by_format.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.default.is_none()
    }
}

/// Builder for `CapabilityRegistry`. Later registrations replace earlier
/// ones for the same capability.
#[derive(Default)]
pub struct RegistryBuilder {
    exact: HashMap<(Format, Intent), Arc<dyn Handler>>,
    by_format: HashMap<Format, Arc<dyn Handler>>,
    default: Option<Arc<dyn Handler>>,
}

impl RegistryBuilder {
    pub fn register(mut self, capability: Capability, handler: Arc<dyn Handler>) -> Self {
        let name = handler.name().to_string();
        let replaced = match capability {
            Capability::Exact(format, intent) => self.exact.insert((format, intent), handler),
            Capability::AnyIntent(format) => self.by_format.insert(format, handler),
        };
        if let Some(old) = replaced {
            tracing::warn!(
                ?capability,
                old = old.name(),
                new = %name,
                "Handler registration replaced an existing one"
            );
        } else {
            tracing::debug!(?capability, handler = %name, "Registered handler");
        }
        self
    }

    pub fn default_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.default = Some(handler);
        self
    }

    pub fn build(self) -> CapabilityRegistry {
        CapabilityRegistry {
            exact: self.exact,
            by_format: self.by_format,
            default: self.default,
        }
    }
}

/// Hot-swappable registry handle. Readers take a snapshot `Arc` and keep
/// using it even if a swap happens mid-task.
pub struct SharedRegistry {
    current: RwLock<Arc<CapabilityRegistry>>,
}

impl SharedRegistry {
    pub fn new(registry: CapabilityRegistry) -> Self {
        Self {
            current: RwLock::new(Arc::new(registry)),
        }
    }

    pub async fn snapshot(&self) -> Arc<CapabilityRegistry> {
        self.current.read().await.clone()
    }

    /// Replace the registry. Returns the previous snapshot.
    pub async fn swap(&self, registry: CapabilityRegistry) -> Arc<CapabilityRegistry> {
        let mut current = self.current.write().await;
        tracing::info!(capabilities = registry.len(), "Capability registry swapped");
        std::mem::replace(&mut *current, Arc::new(registry))
    }
}
