/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Result transport: how the engine reports outputs and status upstream.
//!
//! The engine holds an `Arc<dyn ResultTransport>` and calls it from the
//! terminate procedure.  Failures are logged by the engine and never block
//! the return to `IDLE`.

pub mod http;

pub use http::HttpResultTransport;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::task::{EngineStatus, OutputBundle};

#[derive(Debug, Error)]
pub enum TransportError {
    /// Request could not be built or sent.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with a non-success status.
    #[error("{endpoint} rejected with status {status}")]
    Rejected { endpoint: String, status: u16 },

    /// An output file could not be read for upload.
    #[error("cannot read output file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Upstream sink for task results and engine status.
#[async_trait]
pub trait ResultTransport: Send + Sync {
    /// Deliver the outputs of a finished task, tagged with its secret code.
    async fn send_output(
        &self,
        bundle: &OutputBundle,
        secret_code: &str,
    ) -> Result<(), TransportError>;

    /// Announce the engine's current status.
    async fn send_status(&self, status: EngineStatus) -> Result<(), TransportError>;
}

/// Transport for solo runs without a grading service: everything is logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingTransport;

#[async_trait]
impl ResultTransport for LoggingTransport {
    async fn send_output(
        &self,
        bundle: &OutputBundle,
        secret_code: &str,
    ) -> Result<(), TransportError> {
        for (name, path) in &bundle.files {
            info!(secret = %secret_code, file = %name, path = %path.display(), "output produced");
        }
        for name in &bundle.missing {
            info!(secret = %secret_code, file = %name, "output missing");
        }
        Ok(())
    }

    async fn send_status(&self, status: EngineStatus) -> Result<(), TransportError> {
        info!(%status, "engine status");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn logging_transport_accepts_everything() {
        let t = LoggingTransport;
        let mut bundle = OutputBundle::default();
        bundle.missing.push("result.txt".into());
        t.send_output(&bundle, "solo").await.unwrap();
        t.send_status(EngineStatus::Idle).await.unwrap();
    }
}
