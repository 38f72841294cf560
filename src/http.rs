use std::fs::File;
use std::path::Path;
use std::thread;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{CONTENT_LENGTH, HeaderMap, HeaderValue, USER_AGENT};

use crate::error::MirrorError;
use crate::remote::{SizeOracle, Transfer};

const MAX_RETRIES: usize = 3;
const BASE_DELAY_MS: u64 = 200;

/// Plain HTTP(S) access for portals that publish the same files over the web.
#[derive(Clone)]
pub struct HttpRemote {
    client: Client,
}

impl HttpRemote {
    pub fn new(timeout_secs: u64) -> Result<Self, MirrorError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("odm/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| MirrorError::Filesystem(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|err| MirrorError::RemoteUnreachable {
                path: "<http client>".to_string(),
                message: err.to_string(),
            })?;
        Ok(Self { client })
    }

    fn send_with_retries<F>(&self, remote_path: &str, mut make_req: F) -> Result<Response, MirrorError>
    where
        F: FnMut() -> RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        backoff(attempt);
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        backoff(attempt);
                        attempt += 1;
                        continue;
                    }
                    return Err(MirrorError::RemoteUnreachable {
                        path: remote_path.to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }
    }
}

impl SizeOracle for HttpRemote {
    fn remote_size(&self, remote_path: &str) -> Result<u64, MirrorError> {
        let response = self.send_with_retries(remote_path, || self.client.head(remote_path))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(MirrorError::RemoteNotFound(remote_path.to_string()));
        }
        if !status.is_success() {
            return Err(MirrorError::RemoteUnreachable {
                path: remote_path.to_string(),
                message: format!("HTTP status {}", status.as_u16()),
            });
        }
        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .ok_or_else(|| MirrorError::RemoteSizeUnparseable(remote_path.to_string()))
    }
}

impl Transfer for HttpRemote {
    fn transfer(&self, remote_path: &str, destination: &Path) -> Result<(), MirrorError> {
        let mut response = self.send_with_retries(remote_path, || self.client.get(remote_path))?;
        if !response.status().is_success() {
            return Err(MirrorError::TransferFailed {
                path: remote_path.to_string(),
                message: format!("HTTP status {}", response.status().as_u16()),
            });
        }
        let mut file = File::create(destination).map_err(|err| MirrorError::TransferFailed {
            path: remote_path.to_string(),
            message: err.to_string(),
        })?;
        std::io::copy(&mut response, &mut file).map_err(|err| MirrorError::TransferFailed {
            path: remote_path.to_string(),
            message: err.to_string(),
        })?;
        file.sync_all().map_err(|err| MirrorError::TransferFailed {
            path: remote_path.to_string(),
            message: err.to_string(),
        })
    }
}

fn backoff(attempt: usize) {
    let delay = BASE_DELAY_MS * (attempt as u64 + 1);
    thread::sleep(Duration::from_millis(delay));
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
