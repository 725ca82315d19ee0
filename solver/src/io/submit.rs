//! Posting answers to a judge endpoint.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::types::{Submission, SubmissionResult};
use crate::io::config::SubmitConfig;
use crate::io::reasoner::excerpt;

/// Delivers a submission and interprets the judge's verdict.
///
/// `Err` means the verdict could not be obtained at all (connect failure,
/// timeout). A judge that answers with an error status still yields `Ok`.
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(&self, url: &str, submission: &Submission) -> Result<SubmissionResult>;
}

#[derive(Debug, Clone)]
pub struct HttpSubmitter {
    client: reqwest::Client,
}

impl HttpSubmitter {
    pub fn new(config: &SubmitConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("build submit http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Submitter for HttpSubmitter {
    #[instrument(skip(self, submission), fields(task_url = %submission.url))]
    async fn submit(&self, url: &str, submission: &Submission) -> Result<SubmissionResult> {
        let response = self
            .client
            .post(url)
            .json(submission)
            .send()
            .await
            .with_context(|| format!("post answer to {url}"))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("read response from {url}"))?;
        debug!(%status, bytes = body.len(), "judge responded");
        Ok(interpret_response(status, &body))
    }
}

/// Turn a judge response into a verdict; never fails.
pub fn interpret_response(status: reqwest::StatusCode, body: &str) -> SubmissionResult {
    match serde_json::from_str::<Value>(body) {
        Ok(value) if value.is_object() => SubmissionResult::from_value(&value),
        _ => {
            warn!(%status, "judge response is not a json object");
            SubmissionResult {
                correct: false,
                next_url: None,
                reason: Some(format!("http {status}: {}", excerpt(body, 200))),
            }
        }
    }
}
