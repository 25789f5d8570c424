use std::time::Duration;

use futures_util::TryStreamExt;
use reqwest::header::{CONTENT_LENGTH, IF_NONE_MATCH};
use reqwest::{Method, RequestBuilder, StatusCode};
use tardis_model::{Location, Secret};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};
use url::Url;

use crate::uri::candidate;
use crate::{
    BaseUri, BoxFuture, ByteStream, MAX_NAME_ATTEMPTS, Probe, RemoteMetadata, TransferError,
    TransferProvider, Upload,
};

const PUT_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone)]
enum HttpAuth {
    None,
    Basic { user: String, password: Option<Secret> },
    Bearer(Secret),
}

/// Object store reached over plain HTTP verbs.
///
/// `HEAD` answers `length`, `GET`/`PUT`/`DELETE` move bytes, and
/// `GET <uri>?metadata` returns remote checksums when the Location sets
/// `metadata_supported`.
pub struct HttpProvider {
    base: BaseUri,
    client: reqwest::Client,
    auth: HttpAuth,
    metadata_supported: bool,
    timeout: Duration,
}

impl HttpProvider {
    pub fn from_location(location: &Location, timeout: Duration) -> Result<Self, TransferError> {
        let base = BaseUri::parse(&location.base_uri)?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(TransferError::Configuration(format!(
                "location {} needs an http(s) base URI",
                location.name
            )));
        }

        let auth = match location.param("auth_scheme") {
            None => HttpAuth::None,
            Some(s) if s.eq_ignore_ascii_case("basic") => HttpAuth::Basic {
                user: location
                    .param("user")
                    .ok_or_else(|| {
                        TransferError::Configuration(format!(
                            "location {}: basic auth needs a user",
                            location.name
                        ))
                    })?
                    .to_string(),
                password: location.param("password").map(Secret::new),
            },
            Some(s) if s.eq_ignore_ascii_case("bearer") => {
                HttpAuth::Bearer(Secret::new(location.param("password").ok_or_else(|| {
                    TransferError::Configuration(format!(
                        "location {}: bearer auth needs a token in `password`",
                        location.name
                    ))
                })?))
            }
            Some(other) => {
                return Err(TransferError::Configuration(format!(
                    "location {}: unknown auth scheme {other:?}",
                    location.name
                )));
            }
        };
        if let Some(realm) = location.param("realm") {
            debug!(location = %location.name, %realm, "credentials are sent preemptively, realm is informational");
        }

        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| TransferError::Configuration(format!("HTTP client: {e}")))?;

        Ok(Self {
            base,
            client,
            auth,
            metadata_supported: location.flag("metadata_supported"),
            timeout,
        })
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.auth {
            HttpAuth::None => builder,
            HttpAuth::Basic { user, password } => {
                builder.basic_auth(user, password.as_ref().map(Secret::expose))
            }
            HttpAuth::Bearer(token) => builder.bearer_auth(token.expose()),
        }
    }

    /// Sends a request whose response body is small or absent.
    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, TransferError> {
        Ok(builder.timeout(self.timeout).send().await?)
    }

    async fn head_length(&self, uri: &Url) -> Result<Probe<u64>, TransferError> {
        let response = self.send(self.request(Method::HEAD, uri.clone())).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(Probe::Missing),
            s if s.is_success() => response
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .map(Probe::Found)
                .ok_or_else(|| TransferError::Protocol(format!("HEAD {uri}: no Content-Length"))),
            s => Err(TransferError::Protocol(format!("HEAD {uri}: {s}"))),
        }
    }

    async fn exists(&self, uri: &Url) -> Result<bool, TransferError> {
        let response = self.send(self.request(Method::HEAD, uri.clone())).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            s => Err(TransferError::Protocol(format!("HEAD {uri}: {s}"))),
        }
    }

    async fn put(&self, upload: Upload, target: &Url) -> Result<Url, TransferError> {
        let mut chosen = None;
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let url = candidate(target, attempt)?;
            self.base.check(&url)?;
            if !self.exists(&url).await? {
                chosen = Some(url);
                break;
            }
        }
        let url = chosen.ok_or_else(|| {
            TransferError::Protocol(format!(
                "no free name for {target} after {MAX_NAME_ATTEMPTS} attempts"
            ))
        })?;

        let mut builder = self
            .request(Method::PUT, url.clone())
            .header(IF_NONE_MATCH, "*")
            .body(reqwest::Body::wrap_stream(pump(upload.data)));
        if let Some(size) = upload.size {
            builder = builder.header(CONTENT_LENGTH, size);
        }
        let response = self.send(builder).await?;
        match response.status() {
            StatusCode::PRECONDITION_FAILED => Err(TransferError::Protocol(format!(
                "PUT {url}: object appeared while uploading"
            ))),
            s if s.is_success() => {
                debug!(uri = %url, "stored HTTP replica");
                Ok(url)
            }
            s => Err(TransferError::Protocol(format!("PUT {url}: {s}"))),
        }
    }
}

/// Feeds a reader into a request body from a separate task so the body
/// stream only holds a channel receiver.
fn pump(
    mut data: ByteStream,
) -> impl futures_util::Stream<Item = std::io::Result<Vec<u8>>> + Send + 'static {
    let (tx, rx) = mpsc::channel::<std::io::Result<Vec<u8>>>(4);
    tokio::spawn(async move {
        loop {
            let mut chunk = vec![0u8; PUT_CHUNK];
            match data.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    chunk.truncate(n);
                    if tx.send(Ok(chunk)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "upload source failed");
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });
    futures_util::stream::unfold(rx, |mut rx| async move {
        let item = rx.recv().await?;
        Some((item, rx))
    })
}

impl TransferProvider for HttpProvider {
    fn base(&self) -> &BaseUri {
        &self.base
    }

    fn length<'a>(&'a self, uri: &'a Url) -> BoxFuture<'a, Result<Probe<u64>, TransferError>> {
        Box::pin(async move {
            self.base.check(uri)?;
            self.head_length(uri).await
        })
    }

    fn metadata<'a>(
        &'a self,
        uri: &'a Url,
    ) -> BoxFuture<'a, Result<Probe<RemoteMetadata>, TransferError>> {
        Box::pin(async move {
            self.base.check(uri)?;
            if !self.metadata_supported {
                return Err(TransferError::NotSupported(
                    "remote does not declare metadata_supported",
                ));
            }
            let mut url = uri.clone();
            url.set_query(Some("metadata"));
            let response = self.send(self.request(Method::GET, url)).await?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(Probe::Missing),
                s if s.is_success() => {
                    let meta: RemoteMetadata = response.json().await.map_err(|e| {
                        TransferError::Protocol(format!("metadata for {uri}: {e}"))
                    })?;
                    Ok(Probe::Found(meta))
                }
                s => Err(TransferError::Protocol(format!("GET {uri}?metadata: {s}"))),
            }
        })
    }

    fn open<'a>(&'a self, uri: &'a Url) -> BoxFuture<'a, Result<ByteStream, TransferError>> {
        Box::pin(async move {
            self.base.check(uri)?;
            let response = tokio::time::timeout(
                self.timeout,
                self.request(Method::GET, uri.clone()).send(),
            )
            .await
            .map_err(|_| TransferError::Timeout)??;
            match response.status() {
                StatusCode::NOT_FOUND => Err(TransferError::NotFound(uri.to_string())),
                s if s.is_success() => {
                    let body = response.bytes_stream().map_err(std::io::Error::other);
                    Ok(Box::pin(StreamReader::new(body)) as ByteStream)
                }
                s => Err(TransferError::Protocol(format!("GET {uri}: {s}"))),
            }
        })
    }

    fn store<'a>(
        &'a self,
        upload: Upload,
        target: &'a Url,
    ) -> BoxFuture<'a, Result<Url, TransferError>> {
        Box::pin(async move {
            self.base.check(target)?;
            self.put(upload, target).await
        })
    }

    fn remove<'a>(&'a self, uri: &'a Url) -> BoxFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            self.base.check(uri)?;
            let response = self.send(self.request(Method::DELETE, uri.clone())).await?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(()),
                s if s.is_success() => Ok(()),
                s => Err(TransferError::Protocol(format!("DELETE {uri}: {s}"))),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::{DELETE, GET, HEAD, PUT};
    use httpmock::MockServer;
    use serde_json::json;
    use std::net::TcpListener;

    fn can_bind_localhost() -> bool {
        TcpListener::bind("127.0.0.1:0").is_ok()
    }

    fn provider(server: &MockServer, extra: &[(&str, &str)]) -> HttpProvider {
        let mut location = Location::new("web", "http", &server.url("/replicas/"));
        for (k, v) in extra {
            location = location.with_param(k, v);
        }
        HttpProvider::from_location(&location, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn unknown_auth_scheme_is_configuration_error() {
        let location = Location::new("web", "http", "http://h/r/").with_param("auth_scheme", "digest");
        assert!(matches!(
            HttpProvider::from_location(&location, Duration::from_secs(1)),
            Err(TransferError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn head_gives_length_and_404_is_missing() {
        if !can_bind_localhost() {
            eprintln!("Skipping httpmock tests: cannot bind to localhost");
            return;
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(HEAD).path("/replicas/a.txt");
                then.status(200).body("hello world");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(HEAD).path("/replicas/gone.txt");
                then.status(404);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(HEAD).path("/replicas/broken.txt");
                then.status(500);
            })
            .await;

        let p = provider(&server, &[]);
        let a = p.base().join("a.txt").unwrap();
        assert_eq!(p.length(&a).await.unwrap(), Probe::Found(11));
        let gone = p.base().join("gone.txt").unwrap();
        assert_eq!(p.length(&gone).await.unwrap(), Probe::Missing);
        let broken = p.base().join("broken.txt").unwrap();
        assert!(matches!(p.length(&broken).await, Err(TransferError::Protocol(_))));
    }

    #[tokio::test]
    async fn get_streams_body_with_basic_auth() {
        if !can_bind_localhost() {
            eprintln!("Skipping httpmock tests: cannot bind to localhost");
            return;
        }
        let server = MockServer::start_async().await;
        let get = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/replicas/7/a.txt")
                    .header("authorization", "Basic dXNlcjpwYXNz");
                then.status(200).body("hello world");
            })
            .await;

        let p = provider(&server, &[("auth_scheme", "basic"), ("user", "user"), ("password", "pass")]);
        let uri = p.base().join("7/a.txt").unwrap();
        let mut out = Vec::new();
        p.open(&uri).await.unwrap().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
        get.assert_async().await;
    }

    #[tokio::test]
    async fn metadata_query_only_when_declared() {
        if !can_bind_localhost() {
            eprintln!("Skipping httpmock tests: cannot bind to localhost");
            return;
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/replicas/a.txt").query_param_exists("metadata");
                then.status(200).json_body(json!({
                    "md5": "5eb63bbbe01eeed093cb22bb8f5acdc3",
                    "length": 11
                }));
            })
            .await;

        let uri_path = "a.txt";
        let plain = provider(&server, &[]);
        let uri = plain.base().join(uri_path).unwrap();
        assert!(matches!(plain.metadata(&uri).await, Err(TransferError::NotSupported(_))));

        let declared = provider(&server, &[("metadata_supported", "true")]);
        let meta = declared.metadata(&uri).await.unwrap().found().unwrap();
        assert_eq!(meta.md5.as_deref(), Some("5eb63bbbe01eeed093cb22bb8f5acdc3"));
        assert_eq!(meta.length, Some(11));
        assert_eq!(meta.sha512, None);
    }

    #[tokio::test]
    async fn put_disambiguates_existing_name() {
        if !can_bind_localhost() {
            eprintln!("Skipping httpmock tests: cannot bind to localhost");
            return;
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(HEAD).path("/replicas/a.txt");
                then.status(200).body("taken");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(HEAD).path("/replicas/a_1.txt");
                then.status(404);
            })
            .await;
        let put = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/replicas/a_1.txt")
                    .header("if-none-match", "*")
                    .body("hello world");
                then.status(201);
            })
            .await;

        let p = provider(&server, &[]);
        let target = p.base().join("a.txt").unwrap();
        let stored = p
            .store(Upload::from_bytes(b"hello world".to_vec()), &target)
            .await
            .unwrap();
        assert_eq!(p.base().relativize(&stored).as_deref(), Some("a_1.txt"));
        put.assert_async().await;
    }

    #[tokio::test]
    async fn stored_replica_reads_back() {
        if !can_bind_localhost() {
            eprintln!("Skipping httpmock tests: cannot bind to localhost");
            return;
        }
        let server = MockServer::start_async().await;
        let head = server
            .mock_async(|when, then| {
                when.method(HEAD).path("/replicas/7/run1.txt");
                then.status(404);
            })
            .await;
        let put = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/replicas/7/run1.txt")
                    .header("authorization", "Bearer t0ken")
                    .body("hello world");
                then.status(201);
            })
            .await;
        let get = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/replicas/7/run1.txt")
                    .header("authorization", "Bearer t0ken");
                then.status(200).body("hello world");
            })
            .await;

        let p = provider(&server, &[("auth_scheme", "bearer"), ("password", "t0ken")]);
        let target = p.base().join("7/run1.txt").unwrap();
        let stored = p
            .store(Upload::from_bytes(b"hello world".to_vec()), &target)
            .await
            .unwrap();
        assert_eq!(stored, target);

        let mut out = Vec::new();
        p.open(&stored).await.unwrap().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
        head.assert_async().await;
        put.assert_async().await;
        get.assert_async().await;
    }

    #[tokio::test]
    async fn delete_tolerates_absence() {
        if !can_bind_localhost() {
            eprintln!("Skipping httpmock tests: cannot bind to localhost");
            return;
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(DELETE).path("/replicas/a.txt");
                then.status(404);
            })
            .await;

        let p = provider(&server, &[]);
        let uri = p.base().join("a.txt").unwrap();
        p.remove(&uri).await.unwrap();
        p.remove(&uri).await.unwrap();
    }

    #[tokio::test]
    async fn foreign_uri_is_rejected_without_request() {
        if !can_bind_localhost() {
            eprintln!("Skipping httpmock tests: cannot bind to localhost");
            return;
        }
        let server = MockServer::start_async().await;
        let p = provider(&server, &[]);
        let foreign = Url::parse("http://example.invalid/replicas/a.txt").unwrap();
        assert!(matches!(p.length(&foreign).await, Err(TransferError::Protocol(_))));
        assert!(matches!(p.remove(&foreign).await, Err(TransferError::Protocol(_))));
    }
}
