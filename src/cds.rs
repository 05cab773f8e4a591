use std::error::Error as StdError;
use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::domain::Period;
use crate::error::EtlError;

pub const DEFAULT_ARCHIVE_URL: &str = "https://cds.climate.copernicus.eu/api/v2";
pub const DEFAULT_ARCHIVE_DATASET: &str = "reanalysis-era5-single-levels";

/// Body of a retrieval request for one variable and one month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetrieveRequest {
    pub product_type: String,
    pub format: String,
    pub variable: String,
    pub year: String,
    pub month: String,
    pub day: Vec<String>,
    pub time: Vec<String>,
}

pub fn build_query(variable: &str, period: Period) -> RetrieveRequest {
    RetrieveRequest {
        product_type: "reanalysis".to_string(),
        format: "netcdf".to_string(),
        variable: variable.to_string(),
        year: period.year().to_string(),
        month: format!("{:02}", period.month()),
        day: (1..=period.days_in_month())
            .map(|day| format!("{day:02}"))
            .collect(),
        time: (0..24).map(|hour| format!("{hour:02}:00")).collect(),
    }
}

pub trait ArchiveClient: Send + Sync {
    /// Retrieves `request` from `dataset` into the file at `destination`.
    fn retrieve(
        &self,
        dataset: &str,
        request: &RetrieveRequest,
        destination: &Path,
    ) -> Result<(), EtlError>;
}

/// Archive API key in `UID:KEY` form.
#[derive(Clone, PartialEq, Eq)]
pub struct ArchiveCredential {
    uid: String,
    key: String,
}

impl ArchiveCredential {
    pub fn uid(&self) -> &str {
        &self.uid
    }
}

impl fmt::Debug for ArchiveCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveCredential")
            .field("uid", &self.uid)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl FromStr for ArchiveCredential {
    type Err = EtlError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (uid, key) = value.trim().split_once(':').ok_or_else(|| {
            EtlError::InvalidCredential("archive key must have the form UID:KEY".to_string())
        })?;
        if uid.is_empty() || key.is_empty() {
            return Err(EtlError::InvalidCredential(
                "archive key must have the form UID:KEY".to_string(),
            ));
        }
        Ok(Self {
            uid: uid.to_string(),
            key: key.to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TaskReply {
    state: String,
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Clone)]
pub struct CdsHttpClient {
    client: Client,
    base_url: String,
    credential: ArchiveCredential,
    poll_interval: Duration,
}

impl CdsHttpClient {
    pub fn new(
        base_url: &str,
        credential: ArchiveCredential,
        poll_interval: Duration,
    ) -> Result<Self, EtlError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("era5-etl/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| EtlError::ArchiveHttp(err.to_string()))?,
        );
        // Archive requests can sit in the queue; only individual calls time out.
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|err| EtlError::ArchiveHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credential,
            poll_interval,
        })
    }

    fn submit(&self, dataset: &str, request: &RetrieveRequest) -> Result<TaskReply, EtlError> {
        let url = format!("{}/resources/{dataset}", self.base_url);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.credential.uid, Some(&self.credential.key))
            .json(request)
            .send()
            .map_err(map_http_error)?;
        Self::parse_reply(response)
    }

    fn poll(&self, request_id: &str) -> Result<TaskReply, EtlError> {
        let url = format!("{}/tasks/{request_id}", self.base_url);
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.credential.uid, Some(&self.credential.key))
            .send()
            .map_err(map_http_error)?;
        Self::parse_reply(response)
    }

    fn parse_reply(response: Response) -> Result<TaskReply, EtlError> {
        let response = handle_status(response)?;
        response.json::<TaskReply>().map_err(map_http_error)
    }

    fn download(&self, location: &str, destination: &Path) -> Result<(), EtlError> {
        let url = if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            format!("{}/{}", self.base_url, location.trim_start_matches('/'))
        };
        let mut response = handle_status(self.client.get(&url).send().map_err(map_http_error)?)?;
        let mut file =
            File::create(destination).map_err(|err| EtlError::Filesystem(err.to_string()))?;
        io::copy(&mut response, &mut file).map_err(|err| {
            if is_connection_reset(&err) {
                EtlError::ConnectionReset(err.to_string())
            } else {
                EtlError::ArchiveHttp(err.to_string())
            }
        })?;
        Ok(())
    }
}

impl ArchiveClient for CdsHttpClient {
    fn retrieve(
        &self,
        dataset: &str,
        request: &RetrieveRequest,
        destination: &Path,
    ) -> Result<(), EtlError> {
        let mut reply = self.submit(dataset, request)?;
        loop {
            match reply.state.as_str() {
                "completed" => {
                    let location = reply.location.ok_or_else(|| {
                        EtlError::ArchiveRequestFailed("completed without a location".to_string())
                    })?;
                    debug!("downloading {location}");
                    return self.download(&location, destination);
                }
                "queued" | "running" => {
                    let request_id = reply.request_id.clone().ok_or_else(|| {
                        EtlError::ArchiveRequestFailed("pending request has no id".to_string())
                    })?;
                    debug!("request {request_id} is {}", reply.state);
                    thread::sleep(self.poll_interval);
                    reply = self.poll(&request_id)?;
                }
                "failed" => {
                    let message = reply
                        .error
                        .as_ref()
                        .and_then(|error| error.get("message"))
                        .and_then(Value::as_str)
                        .unwrap_or("request failed")
                        .to_string();
                    return Err(EtlError::ArchiveRequestFailed(message));
                }
                other => {
                    return Err(EtlError::ArchiveRequestFailed(format!(
                        "unexpected request state '{other}'"
                    )));
                }
            }
        }
    }
}

fn handle_status(response: Response) -> Result<Response, EtlError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let message = response
        .text()
        .unwrap_or_else(|_| "archive request failed".to_string());
    Err(EtlError::ArchiveStatus { status, message })
}

/// Connection resets are the only archive failure worth retrying.
fn map_http_error(err: reqwest::Error) -> EtlError {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if is_connection_reset(io_err) {
                return EtlError::ConnectionReset(err.to_string());
            }
        }
        source = cause.source();
    }
    EtlError::ArchiveHttp(err.to_string())
}

fn is_connection_reset(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::ConnectionReset
}
