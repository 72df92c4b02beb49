use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use axum::http::StatusCode;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// A test WebSocket client that sends and receives JSON messages.
pub struct JsonSocket(WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>);

impl JsonSocket {
    pub async fn send(&mut self, msg: &Value) {
        self.0.send(msg.to_string().into()).await.unwrap();
    }

    pub async fn recv(&mut self) -> Result<Value> {
        let msg = tokio::time::timeout(Duration::from_secs(5), self.0.next())
            .await
            .map_err(|_| anyhow!("timed out waiting for a frame"))?
            .ok_or_else(|| anyhow!("WebSocket closed"))??;
        let msg = msg.to_text().map_err(|_| anyhow!("non-string message"))?;
        Ok(serde_json::from_str(msg)?)
    }

    /// Receives frames until one satisfies `pred`, skipping periodic
    /// snapshots and other interleaved broadcasts.
    pub async fn recv_until(&mut self, pred: impl Fn(&Value) -> bool) -> Result<Value> {
        for _ in 0..16 {
            let msg = self.recv().await?;
            if pred(&msg) {
                return Ok(msg);
            }
            info!("skipping frame: {msg}");
        }
        Err(anyhow!("no matching frame within 16 messages"))
    }

    pub async fn recv_closed(&mut self) -> Result<()> {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), self.0.next())
                .await
                .map_err(|_| anyhow!("timed out waiting for close"))?
            {
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => continue,
                Some(Err(_)) => return Ok(()),
            }
        }
    }
}

pub struct TestClient {
    client: reqwest::Client,
    addr: SocketAddr,
}

impl TestClient {
    pub async fn start(router: axum::Router) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, router.layer(TraceLayer::new_for_http())).into_future());
        let client = reqwest::Client::new();
        Ok(Self { client, addr })
    }

    pub async fn get(&self, path: &str) -> Result<String> {
        let url = format!("http://{}/{}", self.addr, path);
        info!("GET {}", url);
        let resp = self.client.get(&url).send().await?;
        assert_eq!(resp.status(), StatusCode::OK);
        Ok(resp.text().await?)
    }

    pub async fn get_status(&self, path: &str) -> Result<StatusCode> {
        let url = format!("http://{}/{}", self.addr, path);
        info!("GET {}", url);
        Ok(self.client.get(&url).send().await?.status())
    }

    pub async fn get_json(&self, path: &str) -> Result<Value> {
        Ok(serde_json::from_str(&self.get(path).await?)?)
    }

    pub async fn post_form(&self, path: &str, form: &[(&str, &str)]) -> Result<(StatusCode, Value)> {
        let url = format!("http://{}/{}", self.addr, path);
        info!("POST {}", url);
        let resp = self.client.post(&url).form(form).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        let value = serde_json::from_str(&body).unwrap_or(Value::Null);
        Ok((status, value))
    }

    /// Creates a session and returns its id.
    pub async fn new_session(&self) -> Result<String> {
        let body = self.get("api/new_session").await?;
        let id: String = serde_json::from_str(&body)?;
        Ok(id)
    }

    pub async fn connect(&self, session_id: &str, user_id: &str) -> Result<JsonSocket> {
        let (socket, _response) = tokio_tungstenite::connect_async(format!(
            "ws://{}/api/{session_id}/{user_id}/session_ws",
            self.addr
        ))
        .await
        .unwrap();
        Ok(JsonSocket(socket))
    }
}

pub fn logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=debug,tower_http=debug", env!("CARGO_CRATE_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .try_init()
        .ok();
}
