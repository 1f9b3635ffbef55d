//! backend contracts and the http implementation.
//!
//! - native: `ureq` is blocking, so each request and its body reads live on a
//!   dedicated thread; chunks reach the session over a `flume` channel.
//! - wasm: `gloo-net` fetch, body consumed through a `ReadableStream` reader.

use async_trait::async_trait;

use crate::error::ChatError;
use crate::turn::{ImageRequest, ImageResponse, TextRequest};

pub const DEFAULT_CHAT_PATH: &str = "/functions/v1/chat";
pub const DEFAULT_IMAGE_PATH: &str = "/functions/v1/generate-image";

// ---------------------- config ----------------------

/// where the backend lives and how to authenticate against it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendConfig {
    pub base_url: String,
    /// opaque bearer credential; sent as `authorization: Bearer <key>`.
    pub api_key: Option<String>,
    pub chat_path: String,
    pub image_path: String,
}

impl BackendConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            chat_path: DEFAULT_CHAT_PATH.to_string(),
            image_path: DEFAULT_IMAGE_PATH.to_string(),
        }
    }

    /// `CHAT_BASE_URL` (required) and `CHAT_API_KEY` (optional).
    pub fn from_env() -> Result<Self, ChatError> {
        let base_url = std::env::var("CHAT_BASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ChatError::Config("CHAT_BASE_URL is not set".into()))?;
        let api_key = std::env::var("CHAT_API_KEY").ok();
        Ok(Self::new(base_url).with_api_key(api_key))
    }

    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key.filter(|k| !k.is_empty());
        self
    }

    pub fn with_paths(mut self, chat: impl Into<String>, image: impl Into<String>) -> Self {
        self.chat_path = chat.into();
        self.image_path = image.into();
        self
    }

    pub fn chat_url(&self) -> String {
        join_url(&self.base_url, &self.chat_path)
    }

    pub fn image_url(&self) -> String {
        join_url(&self.base_url, &self.image_path)
    }

    fn bearer(&self) -> Option<String> {
        self.api_key.as_ref().map(|k| format!("Bearer {k}"))
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

// ---------------------- contracts ----------------------

/// an open response body, read strictly in arrival order.
/// `Ok(None)` is end of data.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait ChunkSource {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ChatError>;
}

#[cfg(not(target_arch = "wasm32"))]
pub type BoxedChunkSource = Box<dyn ChunkSource + Send>;
#[cfg(target_arch = "wasm32")]
pub type BoxedChunkSource = Box<dyn ChunkSource>;

/// the two endpoints a session talks to.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait ChatTransport: Send + Sync {
    /// post the conversation; on a success status return the readable body.
    async fn open_stream(&self, request: &TextRequest) -> Result<BoxedChunkSource, ChatError>;

    /// one request/response round trip to the image endpoint.
    async fn generate_image(&self, request: &ImageRequest) -> Result<ImageResponse, ChatError>;
}

/// adapter for any byte stream (tests, custom transports).
pub struct StreamSource<S> {
    inner: S,
}

impl<S> StreamSource<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[cfg(not(target_arch = "wasm32"))]
#[async_trait]
impl<S> ChunkSource for StreamSource<S>
where
    S: futures_lite::Stream<Item = Result<Vec<u8>, ChatError>> + Unpin + Send,
{
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ChatError> {
        use futures_lite::StreamExt;
        self.inner.next().await.transpose()
    }
}

#[cfg(target_arch = "wasm32")]
#[async_trait(?Send)]
impl<S> ChunkSource for StreamSource<S>
where
    S: futures_lite::Stream<Item = Result<Vec<u8>, ChatError>> + Unpin,
{
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ChatError> {
        use futures_lite::StreamExt;
        self.inner.next().await.transpose()
    }
}

// ---------------------- http transport ----------------------

/// `ChatTransport` over plain http.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    config: BackendConfig,
}

impl HttpTransport {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }
}

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use super::*;
    use bevy::prelude::*;
    use flume::Sender;
    use std::io::Read;

    const READ_BUF: usize = 8 * 1024;
    /// chunks buffered between the reader thread and the session.
    const READ_AHEAD: usize = 32;

    type Chunk = Result<Vec<u8>, ChatError>;

    /// blocking `Read` pumped on its own thread. the session only ever awaits
    /// the channel, so a slow body never holds an async worker.
    pub struct ReaderSource {
        rx: flume::Receiver<Chunk>,
    }

    impl ReaderSource {
        pub fn spawn<R: Read + Send + 'static>(reader: R) -> Result<Self, ChatError> {
            let (tx, rx) = flume::bounded(READ_AHEAD);
            std::thread::Builder::new()
                .name("chat-stream-reader".into())
                .spawn(move || pump(reader, &tx))?;
            Ok(Self { rx })
        }
    }

    /// reads until eof, a read error, or the session dropping its end.
    fn pump<R: Read>(mut reader: R, tx: &Sender<Chunk>) {
        let mut buf = vec![0u8; READ_BUF];
        loop {
            let chunk = match reader.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => Ok(buf[..n].to_vec()),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => Err(ChatError::from(e)),
            };
            let fatal = chunk.is_err();
            if tx.send(chunk).is_err() {
                debug!(target: "bevy_chat_stream", "reader: session gone, closing body");
                return;
            }
            if fatal {
                return;
            }
        }
    }

    #[async_trait]
    impl ChunkSource for ReaderSource {
        async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ChatError> {
            match self.rx.recv_async().await {
                Ok(chunk) => chunk.map(Some),
                // pump hung up: end of body
                Err(_) => Ok(None),
            }
        }
    }

    /// run a blocking call on a fresh thread and await its result.
    async fn off_thread<T, F>(name: &str, job: F) -> Result<T, ChatError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, ChatError> + Send + 'static,
    {
        let (tx, rx) = flume::bounded(1);
        std::thread::Builder::new().name(name.into()).spawn(move || {
            let _ = tx.send(job());
        })?;
        rx.recv_async()
            .await
            .map_err(|_| ChatError::Transport(format!("{name} thread exited")))?
    }

    fn post(config: &BackendConfig, url: &str, accept: &str) -> ureq::RequestBuilder<ureq::typestate::WithBody> {
        let mut req = ureq::Agent::new_with_defaults()
            .post(url)
            .header("content-type", "application/json")
            .header("accept", accept);
        if let Some(bearer) = config.bearer() {
            req = req.header("authorization", &bearer);
        }
        req
    }

    #[async_trait]
    impl ChatTransport for HttpTransport {
        async fn open_stream(&self, request: &TextRequest) -> Result<BoxedChunkSource, ChatError> {
            let url = self.config.chat_url();
            info!(target: "bevy_chat_stream", "open_stream -> {} (msgs={}, mode={:?})",
                url, request.messages.len(), request.mode);

            // the request thread reports the status first, then keeps pumping the body
            let (head_tx, head_rx) = flume::bounded::<Result<(), ChatError>>(1);
            let (tx, rx) = flume::bounded(READ_AHEAD);
            let config = self.config.clone();
            let request = request.clone();
            std::thread::Builder::new()
                .name("chat-stream-request".into())
                .spawn(move || {
                    // ureq turns non-2xx into `Error::StatusCode`
                    match post(&config, &url, "text/event-stream").send_json(&request) {
                        Ok(res) => {
                            if head_tx.send(Ok(())).is_ok() {
                                pump(res.into_body().into_reader(), &tx);
                            }
                        }
                        Err(err) => {
                            let _ = head_tx.send(Err(err.into()));
                        }
                    }
                })?;

            head_rx
                .recv_async()
                .await
                .map_err(|_| ChatError::Transport("request thread exited".into()))??;
            Ok(Box::new(ReaderSource { rx }))
        }

        async fn generate_image(&self, request: &ImageRequest) -> Result<ImageResponse, ChatError> {
            let url = self.config.image_url();
            info!(target: "bevy_chat_stream", "generate_image -> {}", url);

            let config = self.config.clone();
            let request = request.clone();
            off_thread("chat-image-request", move || {
                let res = post(&config, &url, "application/json").send_json(&request)?;
                let body = res.into_body().read_to_string()?;
                Ok(serde_json::from_str(&body)?)
            })
            .await
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use native::ReaderSource;

#[cfg(target_arch = "wasm32")]
mod wasm {
    use super::*;
    use bevy::prelude::*;
    use gloo_net::http::Request;
    use wasm_bindgen::JsValue;
    use wasm_bindgen_futures::JsFuture;
    use web_sys::{ReadableStream, ReadableStreamDefaultReader};

    fn js_error(err: JsValue) -> ChatError {
        ChatError::Transport(format!("{err:?}"))
    }

    /// browser `ReadableStream` body.
    pub struct ReadableStreamSource {
        reader: ReadableStreamDefaultReader,
    }

    impl ReadableStreamSource {
        pub fn new(stream: &ReadableStream) -> Result<Self, ChatError> {
            let reader = ReadableStreamDefaultReader::new(stream).map_err(js_error)?;
            Ok(Self { reader })
        }
    }

    #[async_trait(?Send)]
    impl ChunkSource for ReadableStreamSource {
        async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ChatError> {
            let result = JsFuture::from(self.reader.read()).await.map_err(js_error)?;
            let done = js_sys::Reflect::get(&result, &JsValue::from_str("done"))
                .map_err(js_error)?
                .as_bool()
                .unwrap_or(false);
            if done {
                return Ok(None);
            }
            let value = js_sys::Reflect::get(&result, &JsValue::from_str("value")).map_err(js_error)?;
            Ok(Some(js_sys::Uint8Array::new(&value).to_vec()))
        }
    }

    #[async_trait(?Send)]
    impl ChatTransport for HttpTransport {
        async fn open_stream(&self, request: &TextRequest) -> Result<BoxedChunkSource, ChatError> {
            let url = self.config.chat_url();
            info!(target: "bevy_chat_stream", "open_stream -> {} (msgs={}, mode={:?})",
                url, request.messages.len(), request.mode);

            let mut builder = Request::post(&url).header("accept", "text/event-stream");
            if let Some(bearer) = self.config.bearer() {
                builder = builder.header("authorization", &bearer);
            }
            let resp = builder.json(request)?.send().await?;
            if !resp.ok() {
                return Err(ChatError::Status { status: resp.status() });
            }
            let body = resp.body().ok_or(ChatError::MissingBody)?;
            Ok(Box::new(ReadableStreamSource::new(&body)?))
        }

        async fn generate_image(&self, request: &ImageRequest) -> Result<ImageResponse, ChatError> {
            let url = self.config.image_url();
            info!(target: "bevy_chat_stream", "generate_image -> {}", url);

            let mut builder = Request::post(&url).header("accept", "application/json");
            if let Some(bearer) = self.config.bearer() {
                builder = builder.header("authorization", &bearer);
            }
            let resp = builder.json(request)?.send().await?;
            if !resp.ok() {
                return Err(ChatError::Status { status: resp.status() });
            }
            Ok(resp.json::<ImageResponse>().await?)
        }
    }
}

#[cfg(target_arch = "wasm32")]
pub use wasm::ReadableStreamSource;
