//! Seams to the remote services. Each trait is object safe and shared as
//! `Arc<dyn ...>`; [`HttpClient`] implements all of them over HTTP.

mod http;

use std::collections::BTreeMap;

use async_trait::async_trait;
use url::Url;

use crate::Result;

pub use http::HttpClient;

/// Profile attribute name to new value.
pub type ProfileUpdate = BTreeMap<String, String>;

/// Remote object storage for uploaded media.
#[async_trait]
pub trait StorageApi: Send + Sync {
    /// Upload `bytes` and return the public URL they are served from.
    async fn upload(&self, bytes: Vec<u8>, mime_type: &str) -> Result<Url>;
}

/// Remote profile of the signed-in user.
#[async_trait]
pub trait ProfileApi: Send + Sync {
    async fn update_profile(&self, update: ProfileUpdate) -> Result<()>;
}

/// Fetches raw image bytes by URL.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>>;
}
