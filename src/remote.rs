use crate::{error::FetchError, item::ItemId, metadata::MetadataRecord};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_API_URL: &str =
    "https://api.steampowered.com/ISteamRemoteStorage/GetPublishedFileDetails/v1/";
const USER_AGENT: &str = concat!("modsync/", env!("CARGO_PKG_VERSION"));

pub trait MetadataFetcher: Send + Sync {
    fn fetch(&self, id: ItemId) -> Result<MetadataRecord, FetchError>;

    fn fetch_batch(&self, ids: &[ItemId]) -> Vec<(ItemId, Result<MetadataRecord, FetchError>)> {
        ids.iter().map(|id| (*id, self.fetch(*id))).collect()
    }
}

#[derive(Debug, Clone)]
pub struct WorkshopClient {
    url: String,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl WorkshopClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.connect_timeout = connect;
        self.read_timeout = read;
        self
    }

    pub fn open_session(&self) -> WorkshopSession<'_> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(self.connect_timeout)
            .timeout_read(self.read_timeout)
            .timeout_write(self.read_timeout)
            .build();
        WorkshopSession {
            client: self,
            agent,
        }
    }
}

impl Default for WorkshopClient {
    fn default() -> Self {
        Self::new(DEFAULT_API_URL)
    }
}

impl MetadataFetcher for WorkshopClient {
    fn fetch(&self, id: ItemId) -> Result<MetadataRecord, FetchError> {
        self.open_session().fetch(id)
    }

    fn fetch_batch(&self, ids: &[ItemId]) -> Vec<(ItemId, Result<MetadataRecord, FetchError>)> {
        let session = self.open_session();
        ids.iter().map(|id| (*id, session.fetch(*id))).collect()
    }
}

pub struct WorkshopSession<'a> {
    client: &'a WorkshopClient,
    agent: ureq::Agent,
}

impl WorkshopSession<'_> {
    pub fn fetch(&self, id: ItemId) -> Result<MetadataRecord, FetchError> {
        let id_value = id.to_string();
        let response = self
            .agent
            .post(&self.client.url)
            .set("User-Agent", USER_AGENT)
            .send_form(&[("itemcount", "1"), ("publishedfileids[0]", id_value.as_str())])
            .map_err(|err| transport_error(id, err))?;
        let body: Value = response.into_json().map_err(|err| FetchError::InvalidResponse {
            id,
            reason: format!("body is not JSON: {err}"),
        })?;
        let record = parse_details(id, body)?;
        debug!(%id, title = record.title(), "fetched workshop details");
        Ok(record)
    }
}

fn transport_error(id: ItemId, err: ureq::Error) -> FetchError {
    let message = match err {
        ureq::Error::Status(code, response) => {
            format!("HTTP {code} {}", response.status_text())
        }
        ureq::Error::Transport(transport) => transport.to_string(),
    };
    FetchError::Transport { id, message }
}

pub fn parse_details(id: ItemId, mut body: Value) -> Result<MetadataRecord, FetchError> {
    let invalid = |reason: String| FetchError::InvalidResponse { id, reason };
    let details = body
        .get_mut("response")
        .ok_or_else(|| invalid("missing `response`".to_string()))?
        .get_mut("publishedfiledetails")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| invalid("missing `publishedfiledetails` array".to_string()))?;
    if details.is_empty() {
        return Err(invalid("empty `publishedfiledetails`".to_string()));
    }
    let first = details.swap_remove(0);
    MetadataRecord::from_remote(id, first).map_err(|err| invalid(err.to_string()))
}
