//! Source of the item list.

use super::errors::ProviderError;
use super::model::DisplayItem;
use std::future::Future;

/// Loads the ordered list of items to display.
///
/// An error means the source is unavailable for this attempt. Implementations are
/// shared with spawned reload tasks, hence the bounds.
pub trait ItemProvider: Send + Sync + 'static {
    fn fetch_items(&self) -> impl Future<Output = Result<Vec<DisplayItem>, ProviderError>> + Send;
}

/// Fixed list, used by tests and for running without a database.
#[derive(Clone, Debug, Default)]
pub struct StaticProvider {
    items: Vec<DisplayItem>,
}

impl StaticProvider {
    pub fn new(items: Vec<DisplayItem>) -> Self {
        Self { items }
    }
}

impl ItemProvider for StaticProvider {
    async fn fetch_items(&self) -> Result<Vec<DisplayItem>, ProviderError> {
        Ok(self.items.clone())
    }
}
