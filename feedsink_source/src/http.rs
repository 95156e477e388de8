use std::{collections::VecDeque, pin::Pin, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use observability_deps::tracing::{debug, info, warn};
use reqwest::{IntoUrl, Url, header::ACCEPT};

use crate::{
    Error, EventSource, Result, SourceEvent,
    sse::{SseDecoder, SseEvent},
};

const LAST_EVENT_ID: &str = "Last-Event-ID";
const USER_AGENT: &str = concat!("feedsink/", env!("CARGO_PKG_VERSION"));

type Body = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Reads a server-sent-events feed over HTTP.
///
/// A broken or finished response is followed by a reconnect after the server's requested delay,
/// or the configured one, resuming from the last event id the server sent.
pub struct SseSource {
    url: Url,
    http_client: reqwest::Client,
    reconnect_delay: Duration,
    max_reconnects: Option<usize>,
    reconnects: usize,
    connected: bool,
    last_error: Option<Error>,
    decoder: SseDecoder,
    pending: VecDeque<SseEvent>,
    body: Option<Body>,
}

impl std::fmt::Debug for SseSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseSource")
            .field("url", &self.url)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("max_reconnects", &self.max_reconnects)
            .field("reconnects", &self.reconnects)
            .field("last_event_id", &self.decoder.last_event_id())
            .finish_non_exhaustive()
    }
}

impl SseSource {
    pub fn new<U: IntoUrl>(url: U) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(Error::HttpClient)?;
        Ok(Self {
            url: url.into_url().map_err(Error::FeedUrl)?,
            http_client,
            reconnect_delay: Duration::from_secs(3),
            max_reconnects: None,
            reconnects: 0,
            connected: false,
            last_error: None,
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            body: None,
        })
    }

    /// Delay before reconnecting, unless the server asked for a different one
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Give up after `max` reconnects, the default is to reconnect forever
    pub fn with_max_reconnects(mut self, max: usize) -> Self {
        self.max_reconnects = Some(max);
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The next raw event of the feed
    pub async fn next_sse(&mut self) -> Result<Option<SseEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }

            match &mut self.body {
                Some(body) => match body.next().await {
                    Some(Ok(chunk)) => self.pending.extend(self.decoder.feed(&chunk)),
                    Some(Err(e)) => {
                        warn!(error = %e, url = %self.url, "change feed interrupted");
                        self.body = None;
                    }
                    None => {
                        info!(url = %self.url, "change feed ended");
                        self.body = None;
                    }
                },
                None if !self.connected => {
                    let body =
                        connect(&self.http_client, &self.url, self.decoder.last_event_id()).await?;
                    self.body = Some(body);
                    self.connected = true;
                }
                None => {
                    if self.max_reconnects.is_some_and(|max| self.reconnects >= max) {
                        return match self.last_error.take() {
                            Some(e) => Err(e),
                            None => Ok(None),
                        };
                    }
                    self.reconnects += 1;

                    let delay = self.decoder.retry().unwrap_or(self.reconnect_delay);
                    debug!(?delay, reconnects = self.reconnects, "reconnecting to change feed");
                    tokio::time::sleep(delay).await;

                    self.decoder.reset();
                    let res =
                        connect(&self.http_client, &self.url, self.decoder.last_event_id()).await;
                    match res {
                        Ok(body) => {
                            self.last_error = None;
                            self.body = Some(body);
                        }
                        Err(e) => {
                            warn!(error = %e, "reconnecting to change feed failed");
                            self.last_error = Some(e);
                        }
                    }
                }
            }
        }
    }
}

/// Open the feed, resuming after `last_event_id` if there is one
async fn connect(
    http_client: &reqwest::Client,
    url: &Url,
    last_event_id: Option<&str>,
) -> Result<Body> {
    let mut req = http_client
        .get(url.clone())
        .header(ACCEPT, "text/event-stream");
    if let Some(id) = last_event_id {
        req = req.header(LAST_EVENT_ID, id);
    }

    let resp = req.send().await.map_err(|source| Error::Connect {
        url: url.to_string(),
        source,
    })?;
    let code = resp.status();
    if !code.is_success() {
        return Err(Error::UnexpectedStatus {
            url: url.to_string(),
            code,
        });
    }

    info!(%url, last_event_id, "connected to change feed");
    Ok(Box::pin(resp.bytes_stream()))
}

#[async_trait]
impl EventSource for SseSource {
    async fn next_event(&mut self) -> Result<Option<SourceEvent>> {
        Ok(self
            .next_sse()
            .await?
            .map(|event| SourceEvent::new(event.data)))
    }
}
