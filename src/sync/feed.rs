use crate::{http::request_timeout, models::CatalogCard};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

pub type ByteStream = BoxStream<'static, Result<Bytes, FeedError>>;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("bulk data type `{0}` not found in manifest")]
    MissingBulkType(String),
    #[error("malformed feed: {0}")]
    Framing(String),
}

/// Source of the catalog as one streamed JSON array of card records.
#[async_trait]
pub trait CatalogFeed: Send + Sync {
    async fn open(&self) -> Result<ByteStream, FeedError>;
}

/// Resolves the current bulk download through the published manifest and
/// streams it.
pub struct HttpCatalogFeed {
    client: Client,
    manifest_url: String,
    bulk_type: String,
}

impl HttpCatalogFeed {
    pub fn new(client: Client, manifest_url: impl Into<String>, bulk_type: impl Into<String>) -> Self {
        Self {
            client,
            manifest_url: manifest_url.into(),
            bulk_type: bulk_type.into(),
        }
    }

    async fn download_uri(&self) -> Result<String, FeedError> {
        let response = self
            .client
            .get(&self.manifest_url)
            .timeout(request_timeout())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status {
                url: self.manifest_url.clone(),
                status: status.as_u16(),
            });
        }
        let manifest: Manifest = response.json().await?;
        manifest.download_uri(&self.bulk_type)
    }
}

#[async_trait]
impl CatalogFeed for HttpCatalogFeed {
    async fn open(&self) -> Result<ByteStream, FeedError> {
        let url = self.download_uri().await?;
        info!(target = "cardbulk.sync", url = %url, bulk_type = %self.bulk_type, "downloading catalog");
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status {
                url,
                status: status.as_u16(),
            });
        }
        Ok(response.bytes_stream().map_err(FeedError::from).boxed())
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    data: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    #[serde(rename = "type")]
    kind: String,
    download_uri: String,
}

impl Manifest {
    fn download_uri(self, bulk_type: &str) -> Result<String, FeedError> {
        self.data
            .into_iter()
            .find(|entry| entry.kind == bulk_type)
            .map(|entry| entry.download_uri)
            .ok_or_else(|| FeedError::MissingBulkType(bulk_type.to_string()))
    }
}

/// One record of the bulk feed; everything the catalog does not keep is
/// ignored.
#[derive(Debug, Deserialize)]
pub struct FeedCard {
    pub id: String,
    pub name: String,
    pub set: String,
    pub collector_number: String,
    #[serde(default)]
    pub image_uris: Option<ImageUris>,
    #[serde(default)]
    pub card_faces: Vec<CardFace>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ImageUris {
    #[serde(default)]
    pub normal: String,
}

#[derive(Debug, Deserialize)]
pub struct CardFace {
    #[serde(default)]
    pub image_uris: Option<ImageUris>,
}

impl FeedCard {
    /// Single-faced cards carry their image at the top level; double-faced
    /// ones only per face, and the front face is used.
    pub fn front_image(&self) -> &str {
        if let Some(uris) = &self.image_uris
            && !uris.normal.is_empty()
        {
            return &uris.normal;
        }
        self.card_faces
            .first()
            .and_then(|face| face.image_uris.as_ref())
            .map(|uris| uris.normal.as_str())
            .unwrap_or("")
    }
}

impl From<FeedCard> for CatalogCard {
    fn from(card: FeedCard) -> Self {
        let image_uri = card.front_image().to_string();
        CatalogCard {
            scryfall_id: card.id,
            name: card.name,
            set_code: card.set,
            collector_number: card.collector_number,
            image_uri,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_picks_configured_bulk_type() {
        let manifest: Manifest = serde_json::from_str(
            r#"{"object":"list","data":[
                {"type":"oracle_cards","download_uri":"https://data.example/oracle.json"},
                {"type":"default_cards","download_uri":"https://data.example/default.json","size":1}
            ]}"#,
        )
        .expect("manifest");
        assert_eq!(
            manifest.download_uri("default_cards").expect("listed"),
            "https://data.example/default.json"
        );

        let manifest: Manifest = serde_json::from_str(r#"{"data":[]}"#).expect("manifest");
        let err = manifest.download_uri("default_cards").expect_err("missing");
        assert_eq!(err.to_string(), "bulk data type `default_cards` not found in manifest");
    }

    #[test]
    fn front_image_prefers_top_level_then_first_face() {
        let single: FeedCard = serde_json::from_str(
            r#"{"id":"1","name":"Island","set":"lea","collector_number":"301",
                "image_uris":{"small":"s","normal":"https://img/island.jpg"}}"#,
        )
        .expect("card");
        assert_eq!(single.front_image(), "https://img/island.jpg");

        let double: FeedCard = serde_json::from_str(
            r#"{"id":"2","name":"Delver of Secrets // Insectile Aberration","set":"isd",
                "collector_number":"51","card_faces":[
                    {"image_uris":{"normal":"https://img/front.jpg"}},
                    {"image_uris":{"normal":"https://img/back.jpg"}}]}"#,
        )
        .expect("card");
        assert_eq!(double.front_image(), "https://img/front.jpg");

        let bare: FeedCard =
            serde_json::from_str(r#"{"id":"3","name":"Token","set":"t","collector_number":"1"}"#)
                .expect("card");
        let card = CatalogCard::from(bare);
        assert_eq!(card.image_uri, "");
        assert_eq!(card.set_code, "t");
    }
}
