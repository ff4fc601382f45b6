/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! HTTP client for the grading service.
//!
//! | Endpoint | Body | Timeout |
//! |---|---|---|
//! | `POST /tb/send-status/` | form `localport`, `status` | 1 s |
//! | `POST /tb/send-summary/` | form `localport`, `testbed_type`, `status` | 1 s |
//! | `POST /tb/send-dut-output/` | multipart `localport`, `secret_code`, `file_<name>`… | 10 s |
//!
//! `localport` identifies this testbed to the service: it is the port the
//! testbed's own request listener is reachable on.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use tracing::{debug, warn};

use super::{ResultTransport, TransportError};
use crate::config::RemoteConfig;
use crate::task::{EngineStatus, OutputBundle};

const STATUS_TIMEOUT: Duration = Duration::from_secs(1);
/// Output files can be large.
const OUTPUT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct HttpResultTransport {
    client: Client,
    base_url: String,
    localport: String,
    testbed_type: String,
}

impl HttpResultTransport {
    /// # Errors
    /// [`TransportError::Http`] if the TLS client cannot be initialised.
    pub fn new(remote: &RemoteConfig, testbed_type: &str) -> Result<Self, TransportError> {
        let client = Client::builder()
            .danger_accept_invalid_certs(!remote.ssl_verify)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url(remote),
            localport: remote.listening_port.to_string(),
            testbed_type: testbed_type.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Periodic testbed announcement (type and status).
    pub async fn send_summary(&self, status: EngineStatus) -> Result<(), TransportError> {
        let endpoint = "/tb/send-summary/";
        let resp = self
            .client
            .post(self.url(endpoint))
            .form(&[
                ("localport", self.localport.as_str()),
                ("testbed_type", self.testbed_type.as_str()),
                ("status", status.as_str()),
            ])
            .timeout(STATUS_TIMEOUT)
            .send()
            .await?;
        check(endpoint, resp)
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }
}

fn base_url(remote: &RemoteConfig) -> String {
    let scheme = if remote.use_https { "https" } else { "http" };
    match remote.port {
        Some(port) => format!("{scheme}://{}:{port}", remote.host),
        None => format!("{scheme}://{}", remote.host),
    }
}

fn check(endpoint: &str, resp: Response) -> Result<(), TransportError> {
    let status = resp.status();
    if status.is_success() {
        debug!(endpoint, %status, "request accepted");
        Ok(())
    } else {
        warn!(endpoint, %status, "server rejected the request");
        Err(TransportError::Rejected {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
        })
    }
}

#[async_trait]
impl ResultTransport for HttpResultTransport {
    async fn send_output(
        &self,
        bundle: &OutputBundle,
        secret_code: &str,
    ) -> Result<(), TransportError> {
        let endpoint = "/tb/send-dut-output/";
        let mut form = Form::new()
            .text("localport", self.localport.clone())
            .text("secret_code", secret_code.to_string());

        for (name, path) in &bundle.files {
            let content = tokio::fs::read(path)
                .await
                .map_err(|source| TransportError::File {
                    path: path.display().to_string(),
                    source,
                })?;
            let field = format!("file_{name}");
            let part = Part::bytes(content)
                .file_name(field.clone())
                .mime_str("text/plain")?;
            form = form.part(field, part);
        }
        if !bundle.missing.is_empty() {
            warn!(missing = ?bundle.missing, "uploading without some outputs");
        }

        let resp = self
            .client
            .post(self.url(endpoint))
            .multipart(form)
            .timeout(OUTPUT_TIMEOUT)
            .send()
            .await?;
        check(endpoint, resp)
    }

    async fn send_status(&self, status: EngineStatus) -> Result<(), TransportError> {
        let endpoint = "/tb/send-status/";
        let resp = self
            .client
            .post(self.url(endpoint))
            .form(&[
                ("localport", self.localport.as_str()),
                ("status", status.as_str()),
            ])
            .timeout(STATUS_TIMEOUT)
            .send()
            .await?;
        check(endpoint, resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn remote(port: Option<u16>) -> RemoteConfig {
        RemoteConfig {
            host: "127.0.0.1".into(),
            port,
            use_https: false,
            ssl_verify: true,
            listening_port: 9002,
        }
    }

    /// Accept one request, wait until `needle` shows up in it, answer with
    /// `status_line`, and return everything received.
    async fn one_shot_server(
        status_line: &'static str,
        needle: &'static str,
    ) -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();
            let mut buf = [0u8; 4096];
            while !String::from_utf8_lossy(&seen).contains(needle) {
                let n = sock.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                seen.extend_from_slice(&buf[..n]);
            }
            let reply = format!("HTTP/1.1 {status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            sock.write_all(reply.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&seen).into_owned()
        });
        (port, handle)
    }

    #[test]
    fn base_url_honours_scheme_and_port() {
        assert_eq!(base_url(&remote(None)), "http://127.0.0.1");
        let mut r = remote(Some(8000));
        r.use_https = true;
        assert_eq!(base_url(&r), "https://127.0.0.1:8000");
    }

    #[tokio::test]
    async fn status_is_posted_as_form() {
        let (port, server) = one_shot_server("200 OK", "status=IDLE").await;
        let t = HttpResultTransport::new(&remote(Some(port)), "STM32").unwrap();

        t.send_status(EngineStatus::Idle).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /tb/send-status/ "));
        assert!(request.contains("localport=9002"));
    }

    #[tokio::test]
    async fn non_success_is_rejected() {
        let (port, server) =
            one_shot_server("500 Internal Server Error", "status=TESTING").await;
        let t = HttpResultTransport::new(&remote(Some(port)), "STM32").unwrap();

        let err = t.send_summary(EngineStatus::Testing).await.unwrap_err();
        assert!(matches!(err, TransportError::Rejected { status: 500, .. }));
        assert!(server.await.unwrap().contains("testbed_type=STM32"));
    }

    #[tokio::test]
    async fn output_files_are_attached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.txt");
        std::fs::write(&path, "PASS").unwrap();
        let mut bundle = OutputBundle::default();
        bundle.files.insert("result.txt".into(), path);

        let (port, server) = one_shot_server("200 OK", "PASS").await;
        let t = HttpResultTransport::new(&remote(Some(port)), "STM32").unwrap();
        t.send_output(&bundle, "s3cr3t").await.unwrap();

        let request = server.await.unwrap();
        assert!(request.contains("name=\"file_result.txt\""));
        assert!(request.contains("s3cr3t"));
    }
}
