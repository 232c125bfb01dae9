//! Object storage readers
//!
//! The [`ObjectStore`] trait is the seam to remote storage: given a key it opens
//! a readable byte stream. Two implementations ship with the crate:
//!
//! - [`HttpObjectStore`] streams `GET <base_url>/<key>` through `reqwest`, which
//!   covers S3-compatible endpoints behind presigned or proxied URLs
//! - [`MemoryObjectStore`] serves objects from memory and can script failures

use crate::config::StorageConfig;
use crate::error::{Error, Result, TransferError};
use async_trait::async_trait;
use futures::TryStreamExt;
use std::collections::HashMap;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::RwLock;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::StreamReader;

/// Readable stream of an object's bytes
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Source of object bytes keyed by download id
///
/// Errors raised while *reading* the returned stream should carry their cause in
/// the `io::Error` (a wrapped [`TransferError`] or `reqwest::Error`) so the worker
/// can classify them.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Open a stream over the object stored under `key`
    ///
    /// # Errors
    ///
    /// Fails with a classified [`TransferError`] when the object is missing, access
    /// is denied, or the service cannot be reached.
    async fn open_read_stream(&self, key: &str) -> std::result::Result<ByteStream, TransferError>;

    /// Human-readable name for logging
    fn name(&self) -> &'static str;
}

/// Object store reached over HTTP(S)
#[derive(Clone, Debug)]
pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
    auth_header: Option<String>,
}

impl HttpObjectStore {
    /// Create a store rooted at `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_header: None,
        }
    }

    /// Build a store from configuration
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        if config.base_url.is_empty() {
            return Err(Error::Config {
                message: "storage base_url is required for the HTTP object store".to_string(),
                key: Some("storage.base_url".to_string()),
            });
        }

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_header: config.auth_header.clone(),
        })
    }

    /// Send this `Authorization` header with every request
    pub fn with_auth_header(mut self, value: impl Into<String>) -> Self {
        self.auth_header = Some(value.into());
        self
    }

    /// URL of the object stored under `key`
    ///
    /// Each `/`-separated key segment is percent-encoded.
    pub fn object_url(&self, key: &str) -> String {
        let path = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn open_read_stream(&self, key: &str) -> std::result::Result<ByteStream, TransferError> {
        let url = self.object_url(key);
        let mut request = self.client.get(&url);
        if let Some(auth) = &self.auth_header {
            request = request.header("Authorization", auth);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransferError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let code = xml_element(&body, "Code")
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP_{}", status.as_u16()));
            let message = xml_element(&body, "Message")
                .map(str::to_string)
                .unwrap_or_else(|| status.to_string());
            tracing::debug!(url = %url, status = status.as_u16(), code = %code, "object store rejected read");
            return Err(TransferError::StorageService { code, message });
        }

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(stream)))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Text of the first `<tag>...</tag>` element in an S3-style XML error body
fn xml_element<'a>(body: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    let text = body[start..end].trim();
    (!text.is_empty()).then_some(text)
}

/// What a scripted in-memory object does after its bytes run out
#[derive(Clone, Debug)]
enum Tail {
    Eof,
    Fail(std::io::ErrorKind, String),
    Stall,
}

#[derive(Clone, Debug)]
enum MemoryObject {
    Readable { bytes: Vec<u8>, tail: Tail },
    Unopenable { code: String, message: String },
}

/// In-memory object store
///
/// Objects can be made to fail mid-stream, fail to open, or stall, which makes it
/// useful for exercising transfer error paths.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, MemoryObject>>,
    opens: RwLock<HashMap<String, usize>>,
}

impl MemoryObjectStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a complete object
    pub fn insert(&self, key: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.put(
            key.into(),
            MemoryObject::Readable {
                bytes: bytes.into(),
                tail: Tail::Eof,
            },
        );
    }

    /// Store an object whose stream yields `prefix` and then fails with a connection reset
    pub fn insert_truncated(
        &self,
        key: impl Into<String>,
        prefix: impl Into<Vec<u8>>,
        message: impl Into<String>,
    ) {
        self.put(
            key.into(),
            MemoryObject::Readable {
                bytes: prefix.into(),
                tail: Tail::Fail(std::io::ErrorKind::ConnectionReset, message.into()),
            },
        );
    }

    /// Store an object whose stream yields `prefix` and then never makes progress
    pub fn insert_stalled(&self, key: impl Into<String>, prefix: impl Into<Vec<u8>>) {
        self.put(
            key.into(),
            MemoryObject::Readable {
                bytes: prefix.into(),
                tail: Tail::Stall,
            },
        );
    }

    /// Make opening `key` fail with a storage service error
    pub fn insert_unopenable(
        &self,
        key: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.put(
            key.into(),
            MemoryObject::Unopenable {
                code: code.into(),
                message: message.into(),
            },
        );
    }

    /// Number of times `key` has been opened
    pub fn open_count(&self, key: &str) -> usize {
        self.opens
            .read()
            .map(|opens| opens.get(key).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn put(&self, key: String, object: MemoryObject) {
        match self.objects.write() {
            Ok(mut objects) => {
                objects.insert(key, object);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(key, object);
            }
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn open_read_stream(&self, key: &str) -> std::result::Result<ByteStream, TransferError> {
        if let Ok(mut opens) = self.opens.write() {
            *opens.entry(key.to_string()).or_default() += 1;
        }

        let object = self
            .objects
            .read()
            .map_err(|_| TransferError::Unknown("memory store lock poisoned".to_string()))?
            .get(key)
            .cloned();

        match object {
            Some(MemoryObject::Readable { bytes, tail }) => Ok(Box::pin(ScriptedReader {
                data: Cursor::new(bytes),
                tail,
            })),
            Some(MemoryObject::Unopenable { code, message }) => {
                Err(TransferError::StorageService { code, message })
            }
            None => Err(TransferError::StorageService {
                code: "NoSuchKey".to_string(),
                message: format!("The specified key does not exist: {key}"),
            }),
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Reader that serves a buffer and then behaves according to its tail
struct ScriptedReader {
    data: Cursor<Vec<u8>>,
    tail: Tail,
}

impl AsyncRead for ScriptedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let remaining = self.data.get_ref().len() as u64 - self.data.position();
        if remaining > 0 {
            return Pin::new(&mut self.data).poll_read(cx, buf);
        }
        match &self.tail {
            Tail::Eof => Poll::Ready(Ok(())),
            Tail::Fail(kind, message) => {
                Poll::Ready(Err(std::io::Error::new(*kind, message.clone())))
            }
            Tail::Stall => Poll::Pending,
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn read_all(mut stream: ByteStream) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await?;
        Ok(out)
    }

    #[tokio::test]
    async fn http_store_streams_object_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bucket/videos/clip%201.mp4"))
            .and(header("Authorization", "Bearer token"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"0123456789".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let store = HttpObjectStore::new(format!("{}/bucket/", server.uri()))
            .with_auth_header("Bearer token");
        let stream = store.open_read_stream("videos/clip 1.mp4").await.unwrap();

        assert_eq!(read_all(stream).await.unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn http_store_maps_s3_error_code() {
        let server = MockServer::start().await;
        let body = "<?xml version=\"1.0\"?><Error><Code>NoSuchKey</Code>\
                    <Message>The specified key does not exist.</Message></Error>";
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string(body))
            .mount(&server)
            .await;

        let store = HttpObjectStore::new(server.uri());
        match store.open_read_stream("missing").await {
            Err(TransferError::StorageService { code, message }) => {
                assert_eq!(code, "NoSuchKey");
                assert_eq!(message, "The specified key does not exist.");
            }
            other => panic!("expected StorageService, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn http_store_falls_back_to_status_code() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let store = HttpObjectStore::new(server.uri());
        match store.open_read_stream("busy").await {
            Err(e) => assert_eq!(e.classification(), "HTTP_503"),
            Ok(_) => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn http_store_unreachable_is_network_error() {
        // Nothing listens on port 9 (discard) in test environments.
        let store = HttpObjectStore::new("http://127.0.0.1:9");
        match store.open_read_stream("any").await {
            Err(e) => assert_eq!(e.classification(), "network"),
            Ok(_) => panic!("expected failure"),
        }
    }

    #[test]
    fn from_config_requires_base_url() {
        let result = HttpObjectStore::from_config(&StorageConfig::default());
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn xml_element_extracts_trimmed_text() {
        assert_eq!(xml_element("<a><Code> Slow </Code></a>", "Code"), Some("Slow"));
        assert_eq!(xml_element("<Code></Code>", "Code"), None);
        assert_eq!(xml_element("plain text", "Code"), None);
    }

    #[tokio::test]
    async fn memory_store_serves_and_counts_opens() {
        let store = MemoryObjectStore::new();
        store.insert("k", b"payload".to_vec());

        let bytes = read_all(store.open_read_stream("k").await.unwrap())
            .await
            .unwrap();
        assert_eq!(bytes, b"payload");
        assert_eq!(store.open_count("k"), 1);
    }

    #[tokio::test]
    async fn memory_store_truncated_object_fails_after_prefix() {
        let store = MemoryObjectStore::new();
        store.insert_truncated("k", vec![1u8; 64], "peer reset");

        let mut stream = store.open_read_stream("k").await.unwrap();
        let mut buf = vec![0u8; 64];
        stream.read_exact(&mut buf).await.unwrap();

        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn memory_store_missing_key_is_no_such_key() {
        let store = MemoryObjectStore::new();
        match store.open_read_stream("nope").await {
            Err(e) => assert_eq!(e.classification(), "NoSuchKey"),
            Ok(_) => panic!("expected failure"),
        }
    }
}
