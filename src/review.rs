//! Settling review items by hand once the right catalog entry is known.

use crate::{
    import::IMPORT_LOCATION,
    models::{InventoryItem, ProposedValues},
    store::{Store, StoreError},
};
use tracing::{info, warn};

/// Values the reviewer picked instead of the ones proposed at import time.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub quantity: Option<i64>,
    pub condition: Option<String>,
    pub is_foil: Option<bool>,
    pub language: Option<String>,
}

impl Overrides {
    fn apply(self, proposed: ProposedValues, scryfall_id: String) -> InventoryItem {
        InventoryItem {
            scryfall_id,
            quantity: self.quantity.unwrap_or(proposed.quantity),
            condition: self.condition.unwrap_or(proposed.condition),
            is_foil: self.is_foil.unwrap_or(proposed.is_foil),
            language: self.language.unwrap_or(proposed.language),
            location: IMPORT_LOCATION.to_string(),
        }
    }
}

/// Imports review item `id` as catalog entry `scryfall_id`, merging into an
/// existing inventory row the same way an import does, then removes the item
/// from the queue. Nothing is written when either lookup fails.
pub async fn resolve_review_item(
    store: &dyn Store,
    id: i64,
    scryfall_id: &str,
    overrides: Overrides,
) -> Result<InventoryItem, StoreError> {
    let review = store.get_review_item(id).await?;
    let card = store
        .get_card(scryfall_id)
        .await?
        .ok_or_else(|| StoreError::not_found("card", scryfall_id))?;

    let item = overrides.apply(review.proposed, card.scryfall_id);
    store.add_inventory(&item).await?;
    // The inventory row is in; a lost delete only leaves a stale queue entry.
    if let Err(err) = store.delete_review_item(id).await {
        warn!(target = "cardbulk.review", review_id = id, error = %err, "resolved item could not be removed from review");
    }
    info!(
        target = "cardbulk.review",
        review_id = id,
        job_id = %review.job_id,
        scryfall_id = %item.scryfall_id,
        quantity = item.quantity,
        "review item resolved"
    );
    Ok(item)
}
