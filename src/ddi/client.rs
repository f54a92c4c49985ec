//! HTTP client for the hawkBit DDI API

use super::error::DdiError;
use crate::config::ServerConfig;
use futures::StreamExt;
use md5::{Digest, Md5};
use rauc_hawkbit_shared::{
    BaseResource, CancelDescriptor, ConfigData, DeploymentDescriptor, Execution, Feedback,
    Finished,
};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, RANGE};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Upper bound for a single binary transfer request
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(3600);

/// Current local time in the DDI feedback format
pub fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%dT%H%M%S").to_string()
}

/// Client for the controller resources of one target
#[derive(Debug, Clone)]
pub struct DdiClient {
    http: reqwest::Client,
    /// `{scheme}://{host}/{tenant}/controller/v1/{target}`
    base_url: String,
    timeout: Duration,
}

impl DdiClient {
    /// Create a client for the target described by `config`
    pub fn new(config: &ServerConfig) -> Result<Self, DdiError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.auth_token {
            let value = HeaderValue::from_str(&format!("TargetToken {}", token))
                .map_err(|e| DdiError::Protocol(format!("Invalid auth token: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }

        let timeout = Duration::from_secs(config.timeout_secs);
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(timeout)
            .build()?;

        let scheme = if config.ssl { "https" } else { "http" };
        let base_url = format!(
            "{}://{}/{}/controller/v1/{}",
            scheme,
            config.host.trim_end_matches('/'),
            config.tenant_id,
            config.target_name
        );

        Ok(Self {
            http,
            base_url,
            timeout,
        })
    }

    /// URL of the base poll resource
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// `GET /{tenant}/controller/v1/{target}`
    pub async fn poll_base(&self) -> Result<BaseResource, DdiError> {
        self.get_json(&self.base_url, &[]).await
    }

    /// `GET deploymentBase/{actionId}?c={resource}`
    pub async fn deployment(
        &self,
        action_id: &str,
        resource: &str,
    ) -> Result<DeploymentDescriptor, DdiError> {
        let url = self.url(&format!("deploymentBase/{}", action_id));
        self.get_json(&url, &[("c", resource)]).await
    }

    /// `POST deploymentBase/{actionId}/feedback`
    pub async fn deployment_feedback(
        &self,
        action_id: &str,
        execution: Execution,
        finished: Finished,
        details: Vec<String>,
        percentage: Option<i32>,
    ) -> Result<(), DdiError> {
        debug!("Feedback for action {}: {} / {}", action_id, execution, finished);
        let mut feedback = Feedback::new(action_id, timestamp(), execution, finished, details);
        if let Some(percentage) = percentage {
            feedback = feedback.with_progress(percentage);
        }
        let url = self.url(&format!("deploymentBase/{}/feedback", action_id));
        self.post_json(&url, &feedback).await
    }

    /// `GET cancelAction/{actionId}`
    pub async fn cancel_action(&self, action_id: &str) -> Result<CancelDescriptor, DdiError> {
        let url = self.url(&format!("cancelAction/{}", action_id));
        self.get_json(&url, &[]).await
    }

    /// `POST cancelAction/{stopId}/feedback`
    pub async fn cancel_feedback(
        &self,
        stop_id: &str,
        execution: Execution,
        finished: Finished,
        details: Vec<String>,
    ) -> Result<(), DdiError> {
        debug!("Cancel feedback for {}: {} / {}", stop_id, execution, finished);
        let feedback = Feedback::new(stop_id, timestamp(), execution, finished, details);
        let url = self.url(&format!("cancelAction/{}/feedback", stop_id));
        self.post_json(&url, &feedback).await
    }

    /// `PUT configData` with the device attributes
    pub async fn config_data(
        &self,
        execution: Execution,
        finished: Finished,
        data: &BTreeMap<String, String>,
    ) -> Result<(), DdiError> {
        let body = ConfigData::new(timestamp(), execution, finished, data.clone());
        let url = self.url("configData");
        debug!("PUT {}", url);
        debug!("{}", serde_json::to_string(&body)?);

        let response = self
            .http
            .put(&url)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    /// Download a software module artifact to `dest`, returning its MD5 hex
    /// digest
    pub async fn download_artifact(
        &self,
        module: &str,
        filename: &str,
        dest: &Path,
        max_resumes: u32,
    ) -> Result<String, DdiError> {
        let url = self.url(&format!("softwaremodules/{}/artifacts/{}", module, filename));
        self.get_binary(&url, dest, max_resumes).await
    }

    /// Fetch the published MD5 checksum of a software module artifact
    pub async fn artifact_md5sum(&self, module: &str, filename: &str) -> Result<String, DdiError> {
        let url = self.url(&format!(
            "softwaremodules/{}/artifacts/{}.MD5SUM",
            module, filename
        ));
        self.get_md5sum(&url).await
    }

    /// Fetch a checksum side-channel resource (`<hash>  <filename>`)
    pub async fn get_md5sum(&self, url: &str) -> Result<String, DdiError> {
        let text = self.get_text(url).await?;
        text.split_whitespace()
            .next()
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| DdiError::Protocol(format!("Empty checksum resource at {}", url)))
    }

    /// `GET` a plain text resource
    pub async fn get_text(&self, url: &str) -> Result<String, DdiError> {
        debug!("GET text {}", url);
        let response = self
            .http
            .get(url)
            .header(ACCEPT, "text/plain")
            .timeout(self.timeout)
            .send()
            .await?;
        Ok(check_status(response).await?.text().await?)
    }

    /// Download `url` into `dest` and return the MD5 hex digest of the
    /// content.
    ///
    /// A transfer interrupted mid-stream is resumed with a byte range request
    /// from the last written offset, appending to the same file and digest.
    /// At most `max_resumes` such resumes are made.
    pub async fn get_binary(
        &self,
        url: &str,
        dest: &Path,
        max_resumes: u32,
    ) -> Result<String, DdiError> {
        debug!("GET binary {}", url);

        let mut file = File::create(dest).await?;
        let mut hasher = Md5::new();
        let mut written: u64 = 0;
        let mut resumes: u32 = 0;

        loop {
            let mut request = self
                .http
                .get(url)
                .header(ACCEPT, "application/octet-stream")
                .timeout(DOWNLOAD_TIMEOUT);
            if written > 0 {
                request = request.header(RANGE, format!("bytes={}-", written));
            }

            let response = check_status(request.send().await?).await?;

            if written > 0 && response.status() == StatusCode::OK {
                warn!("Server ignored range request, restarting download from scratch");
                file.set_len(0).await?;
                file.seek(SeekFrom::Start(0)).await?;
                hasher = Md5::new();
                written = 0;
            }

            let stream = response.bytes_stream();
            tokio::pin!(stream);
            let mut interrupted = false;

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) if e.is_body() || e.is_decode() => {
                        debug!(
                            "Connection closed by remote -- retrying to connect and resume from {} bytes",
                            written
                        );
                        interrupted = true;
                        break;
                    }
                    Err(e) => return Err(e.into()),
                };
                file.write_all(&chunk).await?;
                hasher.update(&chunk);
                written += chunk.len() as u64;
            }

            if !interrupted {
                break;
            }

            resumes += 1;
            if resumes > max_resumes {
                return Err(DdiError::ResumeLimit {
                    offset: written,
                    resumes: max_resumes,
                });
            }
        }

        file.flush().await?;
        debug!("Downloaded {} bytes to {}", written, dest.display());
        Ok(hex::encode(hasher.finalize()))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, DdiError> {
        debug!("GET {}", url);
        let response = self
            .http
            .get(url)
            .header(ACCEPT, "application/json")
            .query(query)
            .timeout(self.timeout)
            .send()
            .await?;
        let body = check_status(response).await?.text().await?;
        debug!("{}", body);
        Ok(serde_json::from_str(&body)?)
    }

    async fn post_json<T: Serialize>(&self, url: &str, body: &T) -> Result<(), DdiError> {
        debug!("POST {}", url);
        let response = self
            .http
            .post(url)
            .header(ACCEPT, "application/json")
            .json(body)
            .timeout(self.timeout)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

/// Turn any status other than 200/206 into an API error
async fn check_status(response: Response) -> Result<Response, DdiError> {
    let status = response.status();
    if status == StatusCode::OK || status == StatusCode::PARTIAL_CONTENT {
        return Ok(response);
    }

    if let Ok(description) = response.text().await {
        if !description.is_empty() {
            debug!("API error: {}", description);
        }
    }

    Err(DdiError::api(status.as_u16(), status.canonical_reason()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    const PREFIX: &str = "/DEFAULT/controller/v1/test-target";

    fn config_for(host: String) -> ServerConfig {
        ServerConfig {
            host,
            ssl: false,
            tenant_id: "DEFAULT".into(),
            target_name: "test-target".into(),
            auth_token: Some("secret".into()),
            timeout_secs: 5,
        }
    }

    fn md5_hex(data: &[u8]) -> String {
        hex::encode(Md5::digest(data))
    }

    #[tokio::test]
    async fn test_poll_base() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", PREFIX)
            .match_header("authorization", "TargetToken secret")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "config": { "polling": { "sleep": "12:00:00" } },
                    "_links": {
                        "configData": { "href": format!("{}{}/configData", server.url(), PREFIX) }
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = DdiClient::new(&config_for(server.host_with_port())).unwrap();
        let base = client.poll_base().await.unwrap();

        assert!(base.links.config_data.is_some());
        assert_eq!(base.sleep_time().unwrap(), Duration::from_secs(12 * 3600));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_status_uses_reason_table() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", PREFIX)
            .with_status(401)
            .with_body("unauthorized")
            .create_async()
            .await;

        let client = DdiClient::new(&config_for(server.host_with_port())).unwrap();
        let err = client.poll_base().await.unwrap_err();

        assert!(matches!(err, DdiError::Api { status: 401, .. }));
        assert_eq!(err.to_string(), "401: The request requires user authentication.");
    }

    #[tokio::test]
    async fn test_deployment_query_and_feedback() {
        let mut server = mockito::Server::new_async().await;
        let descriptor = server
            .mock("GET", format!("{}/deploymentBase/3", PREFIX).as_str())
            .match_query(Matcher::UrlEncoded("c".into(), "-2129030598".into()))
            .with_status(200)
            .with_body(json!({ "id": "3", "deployment": { "chunks": [] } }).to_string())
            .create_async()
            .await;
        let feedback = server
            .mock("POST", format!("{}/deploymentBase/3/feedback", PREFIX).as_str())
            .match_body(Matcher::PartialJson(json!({
                "id": "3",
                "status": {
                    "execution": "proceeding",
                    "result": { "finished": "none", "progress": { "percentage": 40 } },
                    "details": ["Installing"]
                }
            })))
            .with_status(200)
            .create_async()
            .await;

        let client = DdiClient::new(&config_for(server.host_with_port())).unwrap();
        let deployment = client.deployment("3", "-2129030598").await.unwrap();
        assert!(deployment.deployment.chunks.is_empty());

        client
            .deployment_feedback(
                "3",
                Execution::Proceeding,
                Finished::None,
                vec!["Installing".into()],
                Some(40),
            )
            .await
            .unwrap();

        descriptor.assert_async().await;
        feedback.assert_async().await;
    }

    #[tokio::test]
    async fn test_config_data_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", format!("{}/configData", PREFIX).as_str())
            .match_body(Matcher::PartialJson(json!({
                "id": "",
                "status": { "execution": "closed", "result": { "finished": "success" } },
                "data": { "vin": "123" }
            })))
            .with_status(200)
            .create_async()
            .await;

        let client = DdiClient::new(&config_for(server.host_with_port())).unwrap();
        let data = BTreeMap::from([("vin".to_string(), "123".to_string())]);
        client
            .config_data(Execution::Closed, Finished::Success, &data)
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_artifact_md5sum() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock(
                "GET",
                format!("{}/softwaremodules/12/artifacts/bundle.raucb.MD5SUM", PREFIX).as_str(),
            )
            .with_status(200)
            .with_body("D41D8CD98F00B204E9800998ECF8427E  bundle.raucb\n")
            .create_async()
            .await;

        let client = DdiClient::new(&config_for(server.host_with_port())).unwrap();
        let sum = client.artifact_md5sum("12", "bundle.raucb").await.unwrap();
        assert_eq!(sum, "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[tokio::test]
    async fn test_binary_download_checksum() {
        let content = b"rauc bundle payload".repeat(100);
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock(
                "GET",
                format!("{}/softwaremodules/12/artifacts/bundle.raucb", PREFIX).as_str(),
            )
            .with_status(200)
            .with_body(content.clone())
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("bundle.raucb");
        let client = DdiClient::new(&config_for(server.host_with_port())).unwrap();
        let checksum = client
            .download_artifact("12", "bundle.raucb", &dest, 3)
            .await
            .unwrap();

        assert_eq!(checksum, md5_hex(&content));
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), content);
    }

    /// Read one HTTP request head from `socket`
    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            head.extend_from_slice(&buf[..n]);
        }
        String::from_utf8_lossy(&head).to_lowercase()
    }

    #[tokio::test]
    async fn test_resume_after_disconnect() {
        let content: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let cut = 7_000usize;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let range_requests = Arc::new(AtomicUsize::new(0));
        let ranges_seen = range_requests.clone();
        let body = content.clone();

        tokio::spawn(async move {
            // First connection drops after `cut` bytes
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            assert!(!request.contains("range:"));
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(&body[..cut]).await.unwrap();
            socket.flush().await.unwrap();
            drop(socket);

            // Second connection must ask for the remainder
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            if request.contains(&format!("range: bytes={}-", cut)) {
                ranges_seen.fetch_add(1, Ordering::SeqCst);
            }
            let rest = &body[cut..];
            let head = format!(
                "HTTP/1.1 206 Partial Content\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\nConnection: close\r\n\r\n",
                rest.len(),
                cut,
                body.len() - 1,
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(rest).await.unwrap();
            socket.flush().await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("bundle.raucb");
        let client = DdiClient::new(&config_for(addr.to_string())).unwrap();
        let checksum = client
            .get_binary(&format!("http://{}/bundle.raucb", addr), &dest, 3)
            .await
            .unwrap();

        assert_eq!(range_requests.load(Ordering::SeqCst), 1);
        assert_eq!(checksum, md5_hex(&content));
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), content);
    }

    #[tokio::test]
    async fn test_resume_limit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            // Every connection drops halfway through
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let _ = read_request(&mut socket).await;
                let head = "HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\n";
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(&[0u8; 10]).await;
                let _ = socket.flush().await;
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("bundle.raucb");
        let client = DdiClient::new(&config_for(addr.to_string())).unwrap();
        let err = client
            .get_binary(&format!("http://{}/bundle.raucb", addr), &dest, 2)
            .await
            .unwrap_err();

        assert!(matches!(err, DdiError::ResumeLimit { resumes: 2, .. }));
    }
}
