//! Maps a normalized import row onto a single catalog entry.
//!
//! Resolution only reads from the store, so any number of resolver workers can
//! run it at once against the same catalog.

use crate::models::{CatalogCard, ReviewIssue};
use crate::store::Store;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CardQuery {
    pub name: String,
    pub set_code: String,
    pub collector_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveFailure {
    #[error("no catalog entry matches")]
    NotFound,
    #[error("{candidates} catalog entries match")]
    Ambiguous { candidates: usize },
    #[error("missing name or set/collector_number")]
    InsufficientFields,
    #[error("catalog lookup failed: {0}")]
    Lookup(String),
}

impl ResolveFailure {
    pub fn issue(&self) -> ReviewIssue {
        match self {
            ResolveFailure::Ambiguous { .. } => ReviewIssue::Ambiguous,
            ResolveFailure::NotFound
            | ResolveFailure::InsufficientFields
            | ResolveFailure::Lookup(_) => ReviewIssue::NotFound,
        }
    }

    /// Extra context stored with the review item; a plain miss needs none.
    pub fn note(&self) -> Option<String> {
        match self {
            ResolveFailure::NotFound => None,
            other => Some(other.to_string()),
        }
    }
}

/// Set + collector number when both are present, otherwise an exact name match
/// narrowed by set when one is given.
pub async fn resolve(store: &dyn Store, query: &CardQuery) -> Result<CatalogCard, ResolveFailure> {
    let candidates = if !query.set_code.is_empty() && !query.collector_number.is_empty() {
        store
            .find_cards_by_set_number(&query.set_code, &query.collector_number)
            .await
    } else if !query.name.is_empty() {
        let set_filter = Some(query.set_code.as_str()).filter(|s| !s.is_empty());
        store.find_cards_by_name(&query.name, set_filter).await
    } else {
        return Err(ResolveFailure::InsufficientFields);
    }
    .map_err(|err| ResolveFailure::Lookup(err.to_string()))?;

    single(candidates)
}

fn single(mut candidates: Vec<CatalogCard>) -> Result<CatalogCard, ResolveFailure> {
    match candidates.len() {
        0 => Err(ResolveFailure::NotFound),
        1 => Ok(candidates.remove(0)),
        n => Err(ResolveFailure::Ambiguous { candidates: n }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::{card, temp_store};

    fn query(name: &str, set_code: &str, collector_number: &str) -> CardQuery {
        CardQuery {
            name: name.into(),
            set_code: set_code.into(),
            collector_number: collector_number.into(),
        }
    }

    async fn seeded() -> (tempfile::TempDir, crate::store::SqliteStore) {
        let (dir, store) = temp_store().await;
        store
            .upsert_cards(&[
                card("island-lea", "Island", "LEA", "301"),
                card("forest-lea", "Forest", "LEA", "295"),
                card("forest-leb", "Forest", "LEB", "295"),
                card("forest-2ed", "Forest", "2ED", "296"),
                card("bolt-lea", "Lightning Bolt", "LEA", "161"),
            ])
            .await
            .expect("seed catalog");
        (dir, store)
    }

    #[tokio::test]
    async fn set_and_number_take_precedence_over_name() {
        let (_dir, store) = seeded().await;
        // The name is wrong on purpose; set + number still identifies the card.
        let found = resolve(&store, &query("Not A Card", "lea", "301"))
            .await
            .expect("resolved");
        assert_eq!(found.scryfall_id, "island-lea");
    }

    #[tokio::test]
    async fn set_and_number_miss_is_not_found() {
        let (_dir, store) = seeded().await;
        let err = resolve(&store, &query("Island", "LEA", "999"))
            .await
            .expect_err("miss");
        assert_eq!(err, ResolveFailure::NotFound);
        assert_eq!(err.issue(), ReviewIssue::NotFound);
        assert_eq!(err.note(), None);
    }

    #[tokio::test]
    async fn name_only_resolves_unique_and_flags_ambiguous() {
        let (_dir, store) = seeded().await;
        let bolt = resolve(&store, &query("lightning bolt", "", ""))
            .await
            .expect("unique name");
        assert_eq!(bolt.scryfall_id, "bolt-lea");

        let err = resolve(&store, &query("Forest", "", ""))
            .await
            .expect_err("three printings");
        assert_eq!(err, ResolveFailure::Ambiguous { candidates: 3 });
        assert_eq!(err.issue(), ReviewIssue::Ambiguous);
        assert_eq!(err.note().as_deref(), Some("3 catalog entries match"));
    }

    #[tokio::test]
    async fn set_filter_narrows_name_matches() {
        let (_dir, store) = seeded().await;
        let found = resolve(&store, &query("Forest", "leb", ""))
            .await
            .expect("narrowed");
        assert_eq!(found.scryfall_id, "forest-leb");
        let err = resolve(&store, &query("Forest", "M10", ""))
            .await
            .expect_err("wrong set");
        assert_eq!(err, ResolveFailure::NotFound);
    }

    #[tokio::test]
    async fn missing_identifiers_are_insufficient() {
        let (_dir, store) = seeded().await;
        let err = resolve(&store, &query("", "", "")).await.expect_err("empty");
        assert_eq!(err, ResolveFailure::InsufficientFields);
        assert_eq!(err.issue(), ReviewIssue::NotFound);
        // A collector number without a set and without a name cannot be used.
        let err = resolve(&store, &query("", "", "301"))
            .await
            .expect_err("number only");
        assert_eq!(err, ResolveFailure::InsufficientFields);
    }

    #[tokio::test]
    async fn duplicate_set_and_number_is_ambiguous() {
        let (_dir, store) = seeded().await;
        store
            .upsert_cards(&[card("island-lea-alt", "Island", "LEA", "301")])
            .await
            .expect("duplicate printing");
        let err = resolve(&store, &query("", "LEA", "301"))
            .await
            .expect_err("two rows");
        assert_eq!(err, ResolveFailure::Ambiguous { candidates: 2 });
    }
}
