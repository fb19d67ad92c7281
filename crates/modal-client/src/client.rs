//! The wire-protocol client
//!
//! Speaks the backend's HTTP API. Every request is credentialed with the
//! current token pair, re-read from the [`CredentialStore`] on each call so
//! that a rotated secret takes effect without a restart.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, instrument};

use crate::api::{
    AppStatus, DeployedApp, EndpointDeployed, EndpointRequest, FunctionDeployed, FunctionRequest,
    JobCreated, JobRequest, LogStream, ModalApi,
};
use crate::credentials::CredentialStore;
use crate::errors::BackendError;

/// Default base URL of the backend control plane.
pub const DEFAULT_BASE_URL: &str = "https://api.modal.com";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A client for the Modal control plane.
pub struct Client {
    base_url: String,
    credentials: Arc<CredentialStore>,
    http: reqwest::Client,
}

impl Client {
    /// Create a client against the default backend URL.
    pub fn new(credentials: Arc<CredentialStore>) -> anyhow::Result<Self> {
        Self::with_base_url(credentials, DEFAULT_BASE_URL)
    }

    /// Create a client against a specific backend URL (used in tests and
    /// self-hosted installations).
    pub fn with_base_url(
        credentials: Arc<CredentialStore>,
        base_url: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Client {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            credentials,
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn authorization(&self) -> String {
        self.credentials.current().await.bearer()
    }

    async fn post_json<B: serde::Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, BackendError> {
        let response = self
            .http
            .post(self.url(path))
            .header(reqwest::header::AUTHORIZATION, self.authorization().await)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        response
            .json::<T>()
            .await
            .map_err(|e| BackendError::Protocol(e.to_string()))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, BackendError> {
        let response = self
            .http
            .get(self.url(path))
            .header(reqwest::header::AUTHORIZATION, self.authorization().await)
            .send()
            .await?
            .error_for_status()?;
        response
            .json::<T>()
            .await
            .map_err(|e| BackendError::Protocol(e.to_string()))
    }
}

#[async_trait]
impl ModalApi for Client {
    #[instrument(level = "info", skip(self, req), fields(name = %req.name, image = %req.image))]
    async fn create_job(&self, req: &JobRequest) -> Result<JobCreated, BackendError> {
        self.post_json("/v1/apps/jobs", req).await
    }

    #[instrument(level = "info", skip(self, req), fields(name = %req.name))]
    async fn create_function(
        &self,
        req: &FunctionRequest,
    ) -> Result<FunctionDeployed, BackendError> {
        self.post_json("/v1/apps/functions", req).await
    }

    #[instrument(level = "info", skip(self, req), fields(name = %req.name))]
    async fn create_endpoint(
        &self,
        req: &EndpointRequest,
    ) -> Result<EndpointDeployed, BackendError> {
        self.post_json("/v1/apps/endpoints", req).await
    }

    async fn app_status(&self, app_id: &str) -> Result<AppStatus, BackendError> {
        match self.get_json(&format!("/v1/apps/{}/status", app_id)).await {
            Err(BackendError::NotFound { .. }) => Err(BackendError::NotFound {
                kind: "app",
                id: app_id.to_owned(),
            }),
            other => other,
        }
    }

    #[instrument(level = "info", skip(self))]
    async fn cancel_job(&self, app_id: &str, function_id: &str) -> Result<(), BackendError> {
        self.http
            .post(self.url(&format!("/v1/apps/{}/stop", app_id)))
            .header(reqwest::header::AUTHORIZATION, self.authorization().await)
            .json(&serde_json::json!({ "functionId": function_id }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    #[instrument(level = "info", skip(self))]
    async fn delete_app(&self, app_id: &str) -> Result<(), BackendError> {
        let response = self
            .http
            .delete(self.url(&format!("/v1/apps/{}", app_id)))
            .header(reqwest::header::AUTHORIZATION, self.authorization().await)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound {
                kind: "app",
                id: app_id.to_owned(),
            });
        }
        response.error_for_status()?;
        Ok(())
    }

    async fn list_deployed_apps(&self) -> Result<Vec<DeployedApp>, BackendError> {
        self.get_json("/v1/apps?deployed=true").await
    }

    async fn stream_app_logs(&self, app_id: &str) -> Result<LogStream, BackendError> {
        debug!(%app_id, "Opening log stream");
        // Log streams outlive the regular request timeout, so this request
        // goes through a client without one.
        let streaming = reqwest::Client::builder()
            .build()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        let response = streaming
            .get(self.url(&format!("/v1/apps/{}/logs?follow=true", app_id)))
            .header(reqwest::header::AUTHORIZATION, self.authorization().await)
            .send()
            .await?
            .error_for_status()?;

        let stream = try_stream! {
            let mut body = response.bytes_stream();
            let mut buf: Vec<u8> = Vec::new();
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| BackendError::Unavailable(e.to_string()))?;
                buf.extend_from_slice(&chunk);
                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    yield String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
                }
            }
            if !buf.is_empty() {
                yield String::from_utf8_lossy(&buf).into_owned();
            }
        };
        Ok(Box::pin(stream))
    }

    async fn replica_addresses(
        &self,
        job_name: &str,
    ) -> Result<BTreeMap<u32, String>, BackendError> {
        // The registry keys replicas as "<jobName>-replica-<rank>".
        let entries: BTreeMap<String, String> = self
            .get_json(&format!("/v1/registry?prefix={}-replica-", job_name))
            .await?;
        let prefix = format!("{}-replica-", job_name);
        let mut addresses = BTreeMap::new();
        for (key, addr) in entries {
            if let Some(rank) = key
                .strip_prefix(&prefix)
                .and_then(|suffix| suffix.parse::<u32>().ok())
            {
                addresses.insert(rank, addr);
            }
        }
        Ok(addresses)
    }
}
