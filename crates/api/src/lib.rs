//! Shadow API: the inbound CRUD surface for shadow resources.
//!
//! Dispatchers (the CLI, or any request router) depend on [`ShadowStorage`];
//! [`CompositeStore`] implements it over an [`shadow_kubehub::ObjectStore`].

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use shadow_core::{ShadowList, ShadowResource, ShadowResult};

mod composite;
mod ctx;
mod settings;
mod table;

pub use composite::CompositeStore;
pub use ctx::RequestCtx;
pub use settings::Settings;
pub use table::{convert_to_table, Table, TableColumn, TableOptions, TableRow, TableSource};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOptions {
    /// Maximum number of items; `None` or 0 returns everything.
    pub limit: Option<usize>,
}

/// Change notification for shadow resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResourceEvent {
    Added(ShadowResource),
    Modified(ShadowResource),
    Deleted(ShadowResource),
}

/// Produces the desired object from the current one (`None` when absent).
pub type MergeFn = Box<dyn FnOnce(Option<ShadowResource>) -> ShadowResult<ShadowResource> + Send>;

/// Inbound CRUD contract for shadow resources.
#[async_trait::async_trait]
pub trait ShadowStorage: Send + Sync {
    /// Apply every component in order, then reconcile the persisted record.
    async fn create(&self, ctx: &RequestCtx, namespace: &str, obj: ShadowResource) -> ShadowResult<ShadowResource>;

    /// Rebuild a shadow resource from its record and live component fetches.
    async fn get(&self, ctx: &RequestCtx, namespace: &str, name: &str) -> ShadowResult<ShadowResource>;

    /// Record summaries only; components are not fetched.
    async fn list(&self, ctx: &RequestCtx, namespace: &str, opts: &ListOptions) -> ShadowResult<ShadowList>;

    /// Full replace through `merge` and create. The flag is always `false`.
    async fn update(
        &self,
        ctx: &RequestCtx,
        namespace: &str,
        name: &str,
        merge: MergeFn,
    ) -> ShadowResult<(ShadowResource, bool)>;

    /// Delete components in order, then the record. Returns a stub and `false`.
    async fn delete(&self, ctx: &RequestCtx, namespace: &str, name: &str) -> ShadowResult<(ShadowResource, bool)>;

    /// Inert: the stream yields nothing and closes at once.
    async fn watch(
        &self,
        ctx: &RequestCtx,
        namespace: &str,
        opts: &ListOptions,
    ) -> ShadowResult<StreamHandle<ResourceEvent>>;

    fn convert_to_table(&self, src: TableSource<'_>, opts: &TableOptions) -> Table;
}

/// Handle for a streaming subscription.
pub struct CancelHandle {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl CancelHandle {
    pub fn cancel(mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }
}

pub struct StreamHandle<T> {
    pub rx: tokio::sync::mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}
