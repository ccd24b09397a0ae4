//! Live transport: REST over reqwest, push events over a WebSocket.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use parley_shared::constants::RAW_EVENT_CHANNEL_CAPACITY;
use parley_shared::protocol::{
    CanMessageResponse, ChatDto, CreateChatRequest, MessageDto, SendMessageRequest,
};
use parley_shared::types::{ChatId, ChatKind, UserId};

use super::DataSource;
use crate::config::ClientConfig;
use crate::error::SourceError;

pub struct HttpDataSource {
    http: reqwest::Client,
    api_url: String,
    ws_url: String,
    token: Option<String>,
}

impl HttpDataSource {
    pub fn new(config: &ClientConfig) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            api_url: config.api_url.clone(),
            ws_url: config.ws_url.clone(),
            token: config.token.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", self.api_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, SourceError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(SourceError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.json::<T>().await?)
}

#[async_trait]
impl DataSource for HttpDataSource {
    async fn create_chat(
        &self,
        participant_ids: &[UserId],
        kind: ChatKind,
        name: Option<&str>,
    ) -> Result<ChatDto, SourceError> {
        let body = CreateChatRequest {
            participant_ids: participant_ids.to_vec(),
            kind,
            name: name.map(str::to_string),
        };
        let response = self.request(Method::POST, "/chats").json(&body).send().await?;
        decode(response).await
    }

    async fn list_chats(&self) -> Result<Vec<ChatDto>, SourceError> {
        let response = self.request(Method::GET, "/chats").send().await?;
        decode(response).await
    }

    async fn send_message(
        &self,
        chat_id: &ChatId,
        request: &SendMessageRequest,
    ) -> Result<MessageDto, SourceError> {
        let path = format!("/chats/{chat_id}/messages");
        let response = self.request(Method::POST, &path).json(request).send().await?;
        decode(response).await
    }

    async fn can_message(&self, peer_id: &UserId) -> Result<CanMessageResponse, SourceError> {
        let path = format!("/users/{peer_id}/can-message");
        let response = self.request(Method::GET, &path).send().await?;
        decode(response).await
    }

    async fn stream_events(&self) -> Result<mpsc::Receiver<String>, SourceError> {
        let mut request = self.ws_url.as_str().into_client_request()?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| SourceError::InvalidRequest(format!("Invalid token header: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (mut ws, _) = tokio_tungstenite::connect_async(request).await?;
        info!(url = %self.ws_url, "Push event stream connected");

        let (tx, rx) = mpsc::channel(RAW_EVENT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(frame) = ws.next().await {
                let text = match frame {
                    Ok(WsMessage::Text(text)) => text.as_str().to_owned(),
                    Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!("Ignoring non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(WsMessage::Ping(payload)) => {
                        if let Err(e) = ws.send(WsMessage::Pong(payload)).await {
                            warn!(error = %e, "Failed to answer ping");
                            break;
                        }
                        continue;
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "Push event stream failed");
                        break;
                    }
                };

                if tx.send(text).await.is_err() {
                    debug!("Event consumer gone, closing push stream");
                    break;
                }
            }
            warn!("Push event stream closed");
        });

        Ok(rx)
    }
}
