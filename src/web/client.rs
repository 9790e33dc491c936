// Thin client for the scraped web interface

use crate::auth::cookie_header;
use crate::error::{ProxyError, Result};
use crate::http::{status_error, ClientKind, HttpTransport};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub const WEB_BASE_URL: &str = "https://claude.ai";

#[derive(Debug, Deserialize)]
struct UploadResponse {
    file_uuid: String,
}

/// Body for a conversation completion turn. The transcript adaptation
/// produces the prompt; images are referenced by uploaded file id.
#[derive(Debug, Clone, Default)]
pub struct CompletionPayload {
    pub prompt: String,
    pub file_uuids: Vec<String>,
    pub external_image_urls: Vec<String>,
}

pub struct WebClient {
    http: Arc<HttpTransport>,
}

impl WebClient {
    pub fn new(http: Arc<HttpTransport>) -> Self {
        Self { http }
    }

    pub fn http(&self) -> &Arc<HttpTransport> {
        &self.http
    }

    fn base(&self, cookie: &str, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("cookie", cookie_header(cookie))
            .header("referer", format!("{}/chats", WEB_BASE_URL))
            .header("origin", WEB_BASE_URL)
    }

    /// Open a conversation with a client-generated uuid.
    pub async fn create_conversation(
        &self,
        cookie: &str,
        organization: &str,
        conversation_uuid: &str,
    ) -> Result<()> {
        let client = self.http.client(ClientKind::Fingerprinted)?;
        let url = format!(
            "{}/api/organizations/{}/chat_conversations",
            WEB_BASE_URL, organization
        );
        let body = json!({ "uuid": conversation_uuid, "name": "" });
        let response = self
            .http
            .send(self.base(cookie, client.post(&url)).json(&body))
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), &text));
        }
        tracing::debug!("opened web conversation {}", conversation_uuid);
        Ok(())
    }

    pub async fn delete_conversation(
        &self,
        cookie: &str,
        organization: &str,
        conversation_uuid: &str,
    ) -> Result<()> {
        let client = self.http.client(ClientKind::Fingerprinted)?;
        let url = format!(
            "{}/api/organizations/{}/chat_conversations/{}",
            WEB_BASE_URL, organization, conversation_uuid
        );
        let response = self
            .http
            .send(self.base(cookie, client.delete(&url)))
            .await?;
        let status = response.status();
        if !status.is_success() && status.as_u16() != 404 {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), &text));
        }
        tracing::debug!("deleted web conversation {}", conversation_uuid);
        Ok(())
    }

    /// Start a completion turn; the response body is the upstream's
    /// event stream and is consumed by the pipeline.
    pub async fn completion(
        &self,
        cookie: &str,
        organization: &str,
        conversation_uuid: &str,
        payload: &CompletionPayload,
    ) -> Result<reqwest::Response> {
        let client = self.http.client(ClientKind::Fingerprinted)?;
        let url = format!(
            "{}/api/organizations/{}/chat_conversations/{}/completion",
            WEB_BASE_URL, organization, conversation_uuid
        );
        let body = json!({
            "prompt": payload.prompt,
            "attachments": [],
            "files": payload.file_uuids,
            "sync_sources": payload.external_image_urls,
            "rendering_mode": "messages",
            "timezone": "UTC",
        });
        let response = self
            .http
            .send(
                self.base(cookie, client.post(&url))
                    .header("accept", "text/event-stream")
                    .json(&body),
            )
            .await?;
        Ok(response)
    }

    /// Upload an image out-of-band; the returned file id goes into the
    /// completion payload.
    pub async fn upload_image(
        &self,
        cookie: &str,
        organization: &str,
        media_type: &str,
        data: Vec<u8>,
    ) -> Result<String> {
        let client = self.http.client(ClientKind::Fingerprinted)?;
        let url = format!("{}/api/{}/upload", WEB_BASE_URL, organization);
        let extension = media_type.strip_prefix("image/").unwrap_or("bin");
        let part = reqwest::multipart::Part::bytes(data)
            .file_name(format!("image.{}", extension))
            .mime_str(media_type)
            .map_err(|e| ProxyError::RequestInvalid(format!("bad image media type: {}", e)))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .http
            .send(self.base(cookie, client.post(&url)).multipart(form))
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), &text));
        }
        let upload: UploadResponse = response
            .json()
            .await
            .map_err(|e| ProxyError::UpstreamFatal(format!("upload response parse: {}", e)))?;
        Ok(upload.file_uuid)
    }
}
