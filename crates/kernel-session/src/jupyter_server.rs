//! Kernels hosted by a Jupyter server.
//!
//! [`JupyterServerProvider`] manages kernels through the server's REST API
//! and hands out a [`WebSocketTransport`] for each kernel's
//! `/api/kernels/{id}/channels` websocket.

use std::sync::Arc;

use futures::future::{self, BoxFuture};
use futures::{FutureExt, SinkExt, StreamExt};
use jupyter_wire::Frame;
use log::{debug, info};
use serde::Deserialize;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use url::Url;

use crate::channel::{FrameSink, FrameStream, Transport};
use crate::error::{KernelError, Result};
use crate::session::{KernelPreference, KernelProvider, StartedKernel};

/// Kernel model returned by `/api/kernels`.
#[derive(Debug, Clone, Deserialize)]
pub struct KernelModel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub execution_state: Option<String>,
}

#[derive(Clone)]
pub struct JupyterServerProvider {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl std::fmt::Debug for JupyterServerProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JupyterServerProvider")
            .field("base_url", &self.base_url.as_str())
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl JupyterServerProvider {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| KernelError::Provider(format!("invalid server URL {}: {}", base_url, e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            token: token.filter(|t| !t.is_empty()),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn api_url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| KernelError::Provider(format!("invalid API path {}: {}", path, e)))
    }

    /// Websocket URL of a kernel's channels endpoint.
    pub fn channels_url(&self, kernel_id: &str, session_id: &str) -> Result<Url> {
        let mut url = self.api_url(&format!("api/kernels/{}/channels", kernel_id))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| KernelError::Provider(format!("cannot use {} for {}", scheme, url)))?;
        url.query_pairs_mut().append_pair("session_id", session_id);
        Ok(url)
    }

    pub fn transport(&self, kernel_id: &str) -> Result<WebSocketTransport> {
        let session_id = uuid::Uuid::new_v4().to_string();
        Ok(WebSocketTransport {
            url: self.channels_url(kernel_id, &session_id)?,
            token: self.token.clone(),
        })
    }

    /// Kernels currently running on the server.
    pub async fn list_kernels(&self) -> Result<Vec<KernelModel>> {
        let url = self.api_url("api/kernels")?;
        let response = self.authorize(self.client.get(url.clone())).send().await;
        let response = check(&url, response)?;
        response
            .json()
            .await
            .map_err(|e| KernelError::Provider(format!("bad kernel list from {}: {}", url, e)))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => {
                request.header(reqwest::header::AUTHORIZATION, format!("token {}", token))
            }
            None => request,
        }
    }
}

fn check(
    url: &Url,
    response: std::result::Result<reqwest::Response, reqwest::Error>,
) -> Result<reqwest::Response> {
    let response =
        response.map_err(|e| KernelError::Provider(format!("request to {} failed: {}", url, e)))?;
    let status = response.status();
    if !status.is_success() {
        return Err(KernelError::Provider(format!("{} returned {}", url, status)));
    }
    Ok(response)
}

impl KernelProvider for JupyterServerProvider {
    fn start_kernel(
        &self,
        preference: KernelPreference,
        path: String,
    ) -> BoxFuture<'static, Result<StartedKernel>> {
        let provider = self.clone();
        async move {
            let url = provider.api_url("api/kernels")?;
            let body = serde_json::json!({ "name": preference.name, "path": path });
            let response = provider
                .authorize(provider.client.post(url.clone()).json(&body))
                .send()
                .await;
            let model: KernelModel = check(&url, response)?
                .json()
                .await
                .map_err(|e| KernelError::Provider(format!("bad kernel model: {}", e)))?;
            info!("[jupyter-server] Started {} kernel {}", model.name, model.id);

            let transport = provider.transport(&model.id)?;
            Ok(StartedKernel {
                kernel_id: model.id,
                transport: Arc::new(transport),
            })
        }
        .boxed()
    }

    fn restart_kernel(&self, kernel_id: String) -> BoxFuture<'static, Result<()>> {
        let provider = self.clone();
        async move {
            let url = provider.api_url(&format!("api/kernels/{}/restart", kernel_id))?;
            let response = provider.authorize(provider.client.post(url.clone())).send().await;
            check(&url, response)?;
            info!("[jupyter-server] Restarted kernel {}", kernel_id);
            Ok(())
        }
        .boxed()
    }

    fn shutdown_kernel(&self, kernel_id: String) -> BoxFuture<'static, Result<()>> {
        let provider = self.clone();
        async move {
            let url = provider.api_url(&format!("api/kernels/{}", kernel_id))?;
            let response = provider.authorize(provider.client.delete(url.clone())).send().await;
            check(&url, response)?;
            info!("[jupyter-server] Shut down kernel {}", kernel_id);
            Ok(())
        }
        .boxed()
    }
}

/// A kernel's channels websocket. Each connect opens a fresh socket.
#[derive(Clone)]
pub struct WebSocketTransport {
    url: Url,
    token: Option<String>,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("url", &self.url.as_str())
            .finish()
    }
}

impl WebSocketTransport {
    pub fn url(&self) -> &Url {
        &self.url
    }
}

fn transport_error(err: tungstenite::Error) -> KernelError {
    KernelError::Transport(err.to_string())
}

fn to_ws_message(frame: Frame) -> tungstenite::Message {
    match frame {
        Frame::Text(text) => tungstenite::Message::Text(text.into()),
        Frame::Binary(bytes) => tungstenite::Message::Binary(bytes),
    }
}

fn from_ws_message(message: tungstenite::Message) -> Option<Frame> {
    match message {
        tungstenite::Message::Text(text) => Some(Frame::Text(text.as_str().to_string())),
        tungstenite::Message::Binary(bytes) => Some(Frame::Binary(bytes)),
        _ => None,
    }
}

impl Transport for WebSocketTransport {
    fn connect(&self) -> BoxFuture<'static, Result<(FrameSink, FrameStream)>> {
        let url = self.url.clone();
        let token = self.token.clone();
        async move {
            let mut request = url.as_str().into_client_request().map_err(transport_error)?;
            if let Some(token) = token {
                let value = HeaderValue::from_str(&format!("token {}", token))
                    .map_err(|e| KernelError::Transport(format!("invalid token: {}", e)))?;
                request.headers_mut().insert(header::AUTHORIZATION, value);
            }

            let (socket, _) = tokio_tungstenite::connect_async(request)
                .await
                .map_err(transport_error)?;
            debug!("[channel] Websocket connected to {}", url);

            let (write, read) = socket.split();
            let sink: FrameSink = Box::pin(
                write
                    .sink_map_err(transport_error)
                    .with(|frame: Frame| future::ready(Ok::<_, KernelError>(to_ws_message(frame)))),
            );
            let stream: FrameStream = Box::pin(read.filter_map(|message| {
                future::ready(match message {
                    Ok(message) => from_ws_message(message).map(Ok),
                    Err(e) => Some(Err(transport_error(e))),
                })
            }));
            Ok((sink, stream))
        }
        .boxed()
    }
}
