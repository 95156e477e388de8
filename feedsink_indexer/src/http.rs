//! A [`DocumentStore`] speaking the OpenSearch/Elasticsearch REST API.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use observability_deps::tracing::{debug, info};
use reqwest::{IntoUrl, Method, RequestBuilder, StatusCode, header::CONTENT_TYPE};
use secrecy::{ExposeSecret, Secret};
use url::Url;

use crate::{DocumentId, DocumentStore, Error, IndexSettings, Result};

/// Error type returned when creating an index that already exists
const ALREADY_EXISTS: &str = "resource_already_exists_exception";

/// HTTP client for an OpenSearch compatible document store
#[derive(Debug, Clone)]
pub struct HttpDocumentStore {
    /// The base URL of the store, e.g. `http://localhost:9200`
    base_url: Url,
    /// Username and password for basic authentication
    basic_auth: Option<(String, Secret<String>)>,
    /// Whether upserts wait for the document to become searchable
    refresh: bool,
    http_client: reqwest::Client,
}

impl HttpDocumentStore {
    /// Create a new [`HttpDocumentStore`]
    ///
    /// `insecure_skip_verify` disables TLS certificate validation. It only exists for local
    /// clusters with self-signed certificates.
    pub fn new<U: IntoUrl>(
        base_url: U,
        insecure_skip_verify: bool,
        request_timeout: Duration,
    ) -> Result<Self> {
        let base_url = base_url.into_url().map_err(Error::BaseUrl)?;
        if base_url.cannot_be_a_base() {
            return Err(Error::CannotBeABase(base_url.to_string()));
        }
        let http_client = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure_skip_verify)
            .timeout(request_timeout)
            .build()
            .map_err(Error::HttpClient)?;

        Ok(Self {
            base_url,
            basic_auth: None,
            refresh: true,
            http_client,
        })
    }

    /// Authenticate every request with `username` and `password`
    pub fn with_basic_auth(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.basic_auth = Some((username.into(), Secret::new(password.into())));
        self
    }

    /// Set whether upserts ask the store to refresh the index before responding
    pub fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The URL of `segments` below the base URL, each segment percent-encoded
    fn url(&self, segments: &[&str]) -> Result<Url> {
        // the url crate resolves these instead of encoding them
        if let Some(dot) = segments.iter().find(|s| matches!(**s, "." | "..")) {
            return Err(Error::DotSegment(dot.to_string()));
        }
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| Error::CannotBeABase(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let req = self.http_client.request(method, url);
        match &self.basic_auth {
            Some((username, password)) => req.basic_auth(username, Some(password.expose_secret())),
            None => req,
        }
    }

    /// Send `req` and read the whole response, whatever its status
    async fn send(
        &self,
        method: Method,
        path: &str,
        req: RequestBuilder,
    ) -> Result<(StatusCode, Bytes)> {
        let resp = req
            .send()
            .await
            .map_err(|src| Error::request_send(method, path, src))?;
        let status = resp.status();
        let content = resp.bytes().await.map_err(Error::Bytes)?;
        Ok((status, content))
    }
}

fn already_exists(content: &[u8]) -> bool {
    content
        .windows(ALREADY_EXISTS.len())
        .any(|w| w == ALREADY_EXISTS.as_bytes())
}

fn api_error(code: StatusCode, content: &Bytes) -> Error {
    Error::ApiError {
        code,
        message: String::from_utf8_lossy(content).into_owned(),
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn index_exists(&self, index: &str) -> Result<bool> {
        let url = self.url(&[index])?;
        let (status, content) = self
            .send(Method::HEAD, index, self.request(Method::HEAD, url))
            .await?;
        match status {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            code => Err(api_error(code, &content)),
        }
    }

    async fn create_index(&self, index: &str, settings: IndexSettings) -> Result<()> {
        let url = self.url(&[index])?;
        let req = self
            .request(Method::PUT, url)
            .json(&settings.to_create_body());
        let (status, content) = self.send(Method::PUT, index, req).await?;
        match status {
            StatusCode::OK | StatusCode::CREATED => {
                info!(index, ?settings, "created index");
                Ok(())
            }
            StatusCode::BAD_REQUEST if already_exists(&content) => {
                debug!(index, "index was created concurrently");
                Ok(())
            }
            code => Err(api_error(code, &content)),
        }
    }

    async fn upsert(&self, index: &str, id: &DocumentId, document: Bytes) -> Result<()> {
        let mut url = self.url(&[index, "_doc", id.as_str()])?;
        if self.refresh {
            url.query_pairs_mut().append_pair("refresh", "true");
        }
        let req = self
            .request(Method::PUT, url)
            .header(CONTENT_TYPE, "application/json")
            .body(document);
        let path = format!("{index}/_doc/{id}");
        let (status, content) = self.send(Method::PUT, &path, req).await?;
        match status {
            StatusCode::OK | StatusCode::CREATED => {
                debug!(index, document_id = %id, %status, "indexed document");
                Ok(())
            }
            code => Err(api_error(code, &content)),
        }
    }
}
