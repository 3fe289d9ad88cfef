//! Telegram Bot API channel

use super::NotifyChannel;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const TELEGRAM_API: &str = "https://api.telegram.org";

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct ApiReply {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Telegram bot channel
pub struct TelegramChannel {
    client: reqwest::Client,
    api_base: String,
    token: String,
    chat_id: String,
}

impl TelegramChannel {
    pub fn new(token: &str, chat_id: &str) -> Result<Self> {
        Self::with_api_base(TELEGRAM_API, token, chat_id)
    }

    /// Channel against a non-default API host
    pub fn with_api_base(api_base: &str, token: &str, chat_id: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            chat_id: chat_id.to_string(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn check(resp: reqwest::Response) -> Result<()> {
        let status = resp.status();
        let reply: ApiReply = resp
            .json()
            .await
            .map_err(|e| Error::Notify(format!("telegram HTTP {}: {}", status, e)))?;
        if !reply.ok {
            return Err(Error::Notify(format!(
                "telegram rejected message: {}",
                reply.description.unwrap_or_else(|| status.to_string())
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl NotifyChannel for TelegramChannel {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        let resp = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&SendMessage {
                chat_id: &self.chat_id,
                text,
            })
            .send()
            .await?;
        Self::check(resp).await
    }

    async fn send_photo(&self, photo: Vec<u8>, caption: &str) -> Result<()> {
        let form = Form::new()
            .text("chat_id", self.chat_id.clone())
            .text("caption", caption.to_string())
            .part(
                "photo",
                Part::bytes(photo)
                    .file_name("detection.jpg")
                    .mime_str("image/jpeg")?,
            );

        let resp = self
            .client
            .post(self.method_url("sendPhoto"))
            .multipart(form)
            .send()
            .await?;
        Self::check(resp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_send_text_posts_to_bot_api() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .and(body_json(json!({"chat_id": "42", "text": "hello"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let channel = TelegramChannel::with_api_base(&server.uri(), "TOKEN", "42").unwrap();
        channel.send_text("hello").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_message_is_notify_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendPhoto"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({"ok": false, "description": "chat not found"})),
            )
            .mount(&server)
            .await;

        let channel = TelegramChannel::with_api_base(&server.uri(), "TOKEN", "42").unwrap();
        let result = channel.send_photo(vec![1, 2, 3], "caption").await;

        match result {
            Err(Error::Notify(msg)) => assert!(msg.contains("chat not found")),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
