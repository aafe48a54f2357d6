//! Posts a flushed batch to the ingestion endpoint with bounded retry.

use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use tracing::{error, warn};

use crate::model::PriceObservation;

const RETRY_BACKOFFS: &[Duration] = &[
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

#[derive(Debug, Serialize)]
struct IngestRequestBody<'a> {
    worker_id: &'a str,
    timestamp: chrono::DateTime<Utc>,
    feeds: &'a [PriceObservation],
}

pub struct HttpSender {
    client: Client,
    ingest_url: String,
    api_key: String,
}

#[derive(Debug)]
pub enum SendOutcome {
    Delivered,
    /// Transient failure; caller should re-enqueue the batch once.
    Retryable,
    /// Non-retryable 4xx; the batch is poison and must be dropped.
    Poison,
}

impl HttpSender {
    pub fn new(client: Client, ingest_url: String, api_key: String) -> Self {
        Self {
            client,
            ingest_url,
            api_key,
        }
    }

    pub async fn send(&self, worker_id: &str, feeds: &[PriceObservation]) -> SendOutcome {
        let body = IngestRequestBody {
            worker_id,
            timestamp: Utc::now(),
            feeds,
        };

        for (attempt, backoff) in std::iter::once(Duration::ZERO)
            .chain(RETRY_BACKOFFS.iter().copied())
            .enumerate()
        {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
            }

            let result = self
                .client
                .post(&self.ingest_url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return SendOutcome::Delivered;
                    }
                    if status.is_client_error() {
                        error!(
                            status = status.as_u16(),
                            worker_id, "ingestion rejected batch as poison"
                        );
                        return SendOutcome::Poison;
                    }
                    warn!(
                        status = status.as_u16(),
                        attempt, "ingestion batch send failed, retrying"
                    );
                }
                Err(e) => {
                    warn!(error = %e, attempt, "ingestion batch send error, retrying");
                }
            }
        }

        SendOutcome::Retryable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_schedule_has_three_backoffs() {
        assert_eq!(RETRY_BACKOFFS.len(), 3);
        assert_eq!(RETRY_BACKOFFS[0], Duration::from_secs(1));
        assert_eq!(RETRY_BACKOFFS[2], Duration::from_secs(4));
    }
}
