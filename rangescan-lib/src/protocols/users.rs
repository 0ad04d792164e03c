//! Client for the upstream batch users endpoint.
//!
//! One call to [`UsersApi::send_batch`] is exactly one POST. The result is
//! either the decoded records or a [`ScanError`] whose variant names the
//! outcome the batch state machine reacts to:
//!
//! | Outcome          | Variant                    |
//! |------------------|----------------------------|
//! | Success          | `Ok(records)`              |
//! | RateLimited      | [`ScanError::RateLimited`] |
//! | UpstreamError    | [`ScanError::Upstream`]    |
//! | Malformed        | [`ScanError::Malformed`]   |
//! | TransportFailure | [`ScanError::Transport`]   |

use crate::error::ScanError;
use crate::types::{IdentifierBatch, MinimalUserRecord};
use reqwest::StatusCode;
use serde::Deserialize;

/// Longest response body kept for logs and error values.
const MAX_LOGGED_BODY: usize = 512;

/// Primary response shape: `{"data": [...]}`.
#[derive(Debug, Deserialize)]
struct DataEnvelope {
    data: Option<Vec<MinimalUserRecord>>,
}

/// Alternate response shape: `{"userIds": [...]}`.
#[derive(Debug, Deserialize)]
struct UserIdsEnvelope {
    #[serde(rename = "userIds")]
    user_ids: Option<Vec<MinimalUserRecord>>,
}

/// Decode a 2xx body into records.
///
/// The primary shape is tried first. When it does not decode, or its record
/// list is absent or null, the alternate shape is tried. A body matching
/// neither is [`ScanError::Malformed`]; an empty list is a valid answer.
pub fn parse_users_response(body: &str) -> Result<Vec<MinimalUserRecord>, ScanError> {
    if let Ok(DataEnvelope { data: Some(records) }) = serde_json::from_str(body) {
        return Ok(records);
    }

    match serde_json::from_str::<UserIdsEnvelope>(body) {
        Ok(UserIdsEnvelope {
            user_ids: Some(records),
        }) => Ok(records),
        Ok(_) => Err(ScanError::malformed(
            "response has neither a data nor a userIds record list",
            Some(truncate_body(body)),
        )),
        Err(e) => Err(ScanError::malformed(
            format!("response is not a known record list: {}", e),
            Some(truncate_body(body)),
        )),
    }
}

fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_LOGGED_BODY {
        return body.to_string();
    }
    let mut end = MAX_LOGGED_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

/// Thin client for `POST <users-endpoint>`.
#[derive(Debug, Clone)]
pub struct UsersApi {
    endpoint: String,
}

impl UsersApi {
    pub fn new<S: Into<String>>(endpoint: S) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send one batch through `http` and classify the answer.
    ///
    /// `proxy` only labels log lines and rate-limit errors.
    pub async fn send_batch(
        &self,
        http: &reqwest::Client,
        proxy: &str,
        batch: &IdentifierBatch,
    ) -> Result<Vec<MinimalUserRecord>, ScanError> {
        let response = http.post(&self.endpoint).json(batch).send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ScanError::RateLimited {
                proxy: proxy.to_string(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| {
                ScanError::transport_with_source("Failed to read response body", e.to_string())
            })?;

        if !status.is_success() {
            tracing::debug!(
                proxy,
                status = status.as_u16(),
                body = %truncate_body(&body),
                "upstream rejected batch"
            );
            return Err(ScanError::upstream(status.as_u16(), truncate_body(&body)));
        }

        parse_users_response(&body)
    }
}
