//! Chunk payloads
//!
//! A payload is an append-only bundle of items of one stream.

use crate::stream::locator::Locator;

/// Append-only chunk contents
pub trait Payload: Clone + Send + Sync + 'static {
    type Locator: Locator;
    type Item: Send + 'static;

    /// Append an item found at `locator`
    fn add_item(&mut self, locator: Self::Locator, item: Self::Item);

    /// Number of items
    fn len(&self) -> usize;

    /// Check if the payload holds no items
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total encoded size of the items in bytes
    fn total_size(&self) -> u64;

    /// Approximate memory footprint in bytes
    fn total_mem_size(&self) -> u64;

    /// Locator of the last item, if any
    fn last_locator(&self) -> Option<Self::Locator>;
}
