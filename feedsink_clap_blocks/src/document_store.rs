//! Config for the document store and the index documents are written to.

use std::time::Duration;

use feedsink_indexer::{HttpDocumentStore, IdField, IndexSettings};
use secrecy::{ExposeSecret, Secret};

/// Where and how documents are stored.
#[derive(Debug, Clone, clap::Parser)]
pub struct DocumentStoreConfig {
    /// Base URL of the document store.
    #[clap(
        long = "store-url",
        env = "FEEDSINK_STORE_URL",
        default_value = "http://localhost:9200",
        action
    )]
    pub url: String,

    /// Accept any TLS certificate of the store.
    ///
    /// Only meant for local clusters running with self-signed certificates.
    #[clap(
        long = "store-insecure-skip-verify",
        env = "FEEDSINK_STORE_INSECURE_SKIP_VERIFY",
        default_value_t = false,
        action
    )]
    pub insecure_skip_verify: bool,

    /// User for basic authentication against the store.
    #[clap(long = "store-username", env = "FEEDSINK_STORE_USERNAME", action)]
    pub username: Option<String>,

    /// Password for basic authentication against the store.
    #[clap(
        long = "store-password",
        env = "FEEDSINK_STORE_PASSWORD",
        requires = "username",
        action
    )]
    pub password: Option<Secret<String>>,

    /// Timeout of a single request to the store.
    #[clap(
        long = "store-request-timeout",
        env = "FEEDSINK_STORE_REQUEST_TIMEOUT",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub request_timeout: Duration,

    /// Make every written document searchable immediately.
    #[clap(
        long = "store-refresh",
        env = "FEEDSINK_STORE_REFRESH",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub refresh: bool,

    /// Index the documents are written to.
    #[clap(
        long = "index",
        env = "FEEDSINK_INDEX",
        default_value = "wikimedia",
        action
    )]
    pub index: String,

    /// Number of primary shards of a newly created index.
    #[clap(
        long = "index-shards",
        env = "FEEDSINK_INDEX_SHARDS",
        default_value = "1",
        action
    )]
    pub number_of_shards: u32,

    /// Number of replicas of a newly created index.
    #[clap(
        long = "index-replicas",
        env = "FEEDSINK_INDEX_REPLICAS",
        default_value = "0",
        action
    )]
    pub number_of_replicas: u32,

    /// Field holding the document id: `meta.id` (string) or `id` (number).
    #[clap(
        long = "id-field",
        env = "FEEDSINK_ID_FIELD",
        default_value = "meta.id",
        action
    )]
    pub id_field: IdField,
}

impl DocumentStoreConfig {
    pub fn settings(&self) -> IndexSettings {
        IndexSettings {
            number_of_shards: self.number_of_shards,
            number_of_replicas: self.number_of_replicas,
        }
    }

    /// Build the HTTP client of the configured store
    pub fn store(&self) -> Result<HttpDocumentStore, feedsink_indexer::Error> {
        let store =
            HttpDocumentStore::new(&self.url, self.insecure_skip_verify, self.request_timeout)?
                .with_refresh(self.refresh);
        Ok(match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                store.with_basic_auth(username, password.expose_secret())
            }
            (Some(username), None) => store.with_basic_auth(username, ""),
            _ => store,
        })
    }
}
