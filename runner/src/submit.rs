use reqwest::{blocking::Client, StatusCode};
use solverbot_data::ResultMessage;
use std::io::Read;
use thiserror::Error;
use tracing::{debug, instrument};

/// how much of an error response is kept for the log
pub const ERROR_BODY_LIMIT: usize = 1000;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("no post url configured")]
    NoUrl,
    #[error("result post to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("post status {status}, message: {message}")]
    Status { status: StatusCode, message: String },
}

/// Sends finished results to the collection endpoint
#[derive(Debug, Clone)]
pub struct Submitter {
    client: Client,
    url: String,
}

impl Submitter {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST the result as json, anything but 200 is an error
    #[instrument(skip_all, fields(job = %result.job), level = "debug")]
    pub fn submit(&self, result: &ResultMessage) -> Result<(), SubmitError> {
        if self.url.is_empty() {
            return Err(SubmitError::NoUrl);
        }

        let mut response = self
            .client
            .post(&self.url)
            .json(result)
            .send()
            .map_err(|source| SubmitError::Transport {
                url: self.url.clone(),
                source,
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            let mut message = Vec::with_capacity(ERROR_BODY_LIMIT);
            // the body is only for the log, a failed read leaves it empty
            let _ = response
                .by_ref()
                .take(ERROR_BODY_LIMIT as u64)
                .read_to_end(&mut message);

            return Err(SubmitError::Status {
                status,
                message: String::from_utf8_lossy(&message).into_owned(),
            });
        }

        debug!(url = %self.url, "Result accepted");

        Ok(())
    }
}
