use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, RequestBuilder, Response};
use serde_json::{json, Value};
use snafu::prelude::*;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use super::{
    services, HttpSnafu, InputError, InputSnafu, JsonSnafu, Query, QueryResult, Repository,
    RepositoryError, ServiceInput, ServiceSnafu, StatusSnafu, WriteInputSnafu,
};
use crate::settings::{Authentication, ConnectionSettings};

/// Capacity of the in-memory stream between the archive writer and the request body.
const BODY_PIPE_CAPACITY: usize = 64 * 1024;

/// Repository reached over HTTP(S).
///
/// Queries are posted as JSON to `/api/query`. Services are posted to
/// `/api/execute/{service}`, as JSON or, with an attached input, as a multipart form
/// whose `input` part is streamed while it is generated.
pub struct HttpRepository {
    client: Client,
    base_url: String,
    token: Option<String>,
    session: Option<String>,
    /// Session was opened by us and must be closed on disconnect
    owns_session: bool,
}

impl HttpRepository {
    /// Opens a connection and authenticates.
    pub async fn connect(settings: &ConnectionSettings) -> Result<Self, RepositoryError> {
        let client = Client::builder()
            .user_agent(concat!("dicom-upload/", env!("CARGO_PKG_VERSION")))
            .build()
            .context(HttpSnafu)?;
        let mut repository = HttpRepository {
            client,
            base_url: settings.base_url(),
            token: None,
            session: None,
            owns_session: false,
        };
        match &settings.authentication {
            Authentication::Token(token) => repository.token = Some(token.clone()),
            Authentication::Session(sid) => repository.session = Some(sid.clone()),
            Authentication::Credentials {
                domain,
                user,
                password,
            } => {
                info!("Logging on to {} as {}:{}", repository.base_url, domain, user);
                let re = repository
                    .execute(
                        services::LOGON,
                        json!({ "domain": domain, "user": user, "password": password }),
                        None,
                    )
                    .await?;
                let session = re
                    .get("session")
                    .and_then(Value::as_str)
                    .with_context(|| ServiceSnafu {
                        message: "logon response carries no session".to_string(),
                    })?;
                repository.session = Some(session.to_string());
                repository.owns_session = true;
            }
        }
        Ok(repository)
    }

    /// Closes the session if it was opened by [`connect`](Self::connect).
    pub async fn disconnect(self) {
        if self.owns_session {
            if let Err(e) = self.execute(services::LOGOFF, json!({}), None).await {
                warn!("Failed to log off: {}", snafu::Report::from_error(e));
            }
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        match &self.session {
            Some(sid) => request.header("x-session-id", sid),
            None => request,
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: Response,
    ) -> Result<T, RepositoryError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return StatusSnafu { status, body }.fail();
        }
        let bytes = response.bytes().await.context(HttpSnafu)?;
        serde_json::from_slice(&bytes).context(JsonSnafu)
    }

    async fn execute_with_input(
        &self,
        url: String,
        args: &Value,
        input: ServiceInput,
    ) -> Result<Value, RepositoryError> {
        let ServiceInput {
            mime_type,
            name,
            source,
        } = input;

        let (mut writer, reader) = tokio::io::duplex(BODY_PIPE_CAPACITY);
        let part = Part::stream(Body::wrap_stream(ReaderStream::new(reader)))
            .file_name(name)
            .mime_str(&mime_type)
            .context(HttpSnafu)?;
        let args = serde_json::to_string(args).context(JsonSnafu)?;
        let form = Form::new()
            .part("args", Part::text(args).mime_str("application/json").context(HttpSnafu)?)
            .part("input", part);

        let request = self.authorize(self.client.post(url)).multipart(form).send();
        let copy = async move {
            source.copy_to(&mut writer).await?;
            writer.shutdown().await.context(WriteInputSnafu)?;
            Ok::<_, InputError>(())
        };

        let (response, copied) = tokio::join!(request, copy);
        match copied {
            Ok(()) => Self::read_json(response.context(HttpSnafu)?).await,
            // a failed producer explains a failed request
            Err(e @ (InputError::ProducerFailed { .. } | InputError::ProducerPanicked { .. })) => {
                Err(e).context(InputSnafu)
            }
            // the server dropped the body, e.g. after rejecting the request early
            Err(e) => match response {
                Ok(response) if !response.status().is_success() => Self::read_json(response).await,
                Ok(_) => Err(e).context(InputSnafu),
                Err(source) => {
                    debug!("upload body not completed: {}", e);
                    Err(source).context(HttpSnafu)
                }
            },
        }
    }
}

#[async_trait]
impl Repository for HttpRepository {
    async fn query(&self, query: &Query) -> Result<QueryResult, RepositoryError> {
        debug!("asset query: {}", query);
        let response = self
            .authorize(self.client.post(format!("{}/api/query", self.base_url)))
            .json(query)
            .send()
            .await
            .context(HttpSnafu)?;
        Self::read_json(response).await
    }

    async fn execute(
        &self,
        service: &str,
        args: Value,
        input: Option<ServiceInput>,
    ) -> Result<Value, RepositoryError> {
        debug!("executing service {}", service);
        let url = format!("{}/api/execute/{}", self.base_url, service);
        match input {
            Some(input) => self.execute_with_input(url, &args, input).await,
            None => {
                let response = self
                    .authorize(self.client.post(url))
                    .json(&args)
                    .send()
                    .await
                    .context(HttpSnafu)?;
                Self::read_json(response).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::SocketAddr;
    use std::time::Duration;

    use flate2::read::GzDecoder;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    use super::*;
    use crate::repository::{Action, Filter};
    use crate::settings::Transport;
    use crate::upload::archive::ArchiveInput;
    use crate::utils::Cid;

    /// A request as seen by the test server, head lowercased.
    struct Received {
        head: String,
        body: Vec<u8>,
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    async fn read_head(stream: &mut TcpStream, buf: &mut Vec<u8>) -> String {
        loop {
            if let Some(end) = find(buf, b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                buf.drain(..end + 4);
                return head;
            }
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before the request head");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn dechunk(mut data: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        loop {
            let line_end = find(data, b"\r\n").unwrap();
            let size = std::str::from_utf8(&data[..line_end]).unwrap();
            let size = usize::from_str_radix(size.trim(), 16).unwrap();
            data = &data[line_end + 2..];
            if size == 0 {
                return body;
            }
            body.extend_from_slice(&data[..size]);
            data = &data[size + 2..];
        }
    }

    async fn read_request(stream: &mut TcpStream) -> Received {
        let mut buf = Vec::new();
        let head = read_head(stream, &mut buf).await;
        let chunked = head.contains("transfer-encoding: chunked");
        let length = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        loop {
            let complete = if chunked {
                buf.ends_with(b"0\r\n\r\n")
            } else {
                buf.len() >= length
            };
            if complete {
                break;
            }
            let mut chunk = [0u8; 16 * 1024];
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let body = if chunked { dechunk(&buf) } else { buf };
        Received { head, body }
    }

    async fn respond(stream: &mut TcpStream, status: &str, body: &str) {
        let response = format!(
            "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();
    }

    /// Answers one connection per canned response and returns the requests.
    async fn serve(
        responses: Vec<(&'static str, &'static str)>,
    ) -> (SocketAddr, JoinHandle<Vec<Received>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut received = Vec::new();
            for (status, body) in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                received.push(read_request(&mut stream).await);
                respond(&mut stream, status, body).await;
            }
            received
        });
        (addr, handle)
    }

    /// Answers as soon as the request head arrived, then drains the connection.
    async fn reject_early(
        status: &'static str,
        body: &'static str,
    ) -> (SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            read_head(&mut stream, &mut buf).await;
            respond(&mut stream, status, body).await;
            let mut sink = [0u8; 16 * 1024];
            while let Ok(n) = stream.read(&mut sink).await {
                if n == 0 {
                    break;
                }
            }
        });
        (addr, handle)
    }

    fn settings(addr: SocketAddr, authentication: Authentication) -> ConnectionSettings {
        ConnectionSettings {
            transport: Transport::Http,
            host: addr.ip().to_string(),
            port: addr.port(),
            authentication,
        }
    }

    async fn with_token(addr: SocketAddr) -> HttpRepository {
        HttpRepository::connect(&settings(addr, Authentication::Token("Tok-1".into())))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_query_with_token() {
        let (addr, server) =
            serve(vec![("200 OK", r#"{"type":"cids","result":["1.5.1.1"]}"#)]).await;
        let repository = with_token(addr).await;

        let query =
            Query::new(Filter::cid_within(&"1.5".parse().unwrap()), Action::GetCid).size(10);
        let cids = repository.query(&query).await.unwrap().into_cids().unwrap();
        assert_eq!(cids, vec!["1.5.1.1".parse::<Cid>().unwrap()]);

        let received = server.await.unwrap();
        assert!(received[0].head.starts_with("post /api/query http/1.1"));
        assert!(received[0].head.contains("authorization: bearer tok-1"));
        let sent: Query = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(sent, query);
    }

    #[tokio::test]
    async fn test_logon_session_and_logoff() {
        let (addr, server) = serve(vec![
            ("200 OK", r#"{"session":"S-1"}"#),
            ("200 OK", r#"{"asset":null}"#),
            ("200 OK", "{}"),
        ])
        .await;
        let credentials = Authentication::Credentials {
            domain: "system".into(),
            user: "uploader".into(),
            password: "secret".into(),
        };
        let repository = HttpRepository::connect(&settings(addr, credentials)).await.unwrap();
        repository
            .execute(services::ASSET_GET, json!({ "cid": "1.5" }), None)
            .await
            .unwrap();
        repository.disconnect().await;

        let received = server.await.unwrap();
        assert!(received[0].head.starts_with("post /api/execute/system.logon "));
        let logon: Value = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(logon["user"], "uploader");
        assert!(received[1].head.starts_with("post /api/execute/asset.get "));
        assert!(received[1].head.contains("x-session-id: s-1"));
        assert!(!received[1].head.contains("authorization:"));
        assert!(received[2].head.starts_with("post /api/execute/system.logoff "));
        assert!(received[2].head.contains("x-session-id: s-1"));
    }

    #[tokio::test]
    async fn test_error_status_keeps_body() {
        let (addr, server) =
            serve(vec![("500 Internal Server Error", "asset 1.5 does not exist")]).await;
        let repository = with_token(addr).await;
        let err = repository
            .execute(services::ASSET_GET, json!({ "cid": "1.5" }), None)
            .await
            .unwrap_err();
        match err {
            RepositoryError::Status { status, body } => {
                assert_eq!(status.as_u16(), 500);
                assert_eq!(body, "asset 1.5 does not exist");
            }
            other => panic!("unexpected error: {}", other),
        }
        server.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_streamed_multipart_upload() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
        let expected = payload.clone();
        let (addr, server) = serve(vec![("200 OK", r#"{"cid":"1.5.1.2"}"#)]).await;
        let repository = with_token(addr).await;

        let input = ArchiveInput::new("1.dcm", 6, move |out: &mut dyn Write| {
            out.write_all(&payload)?;
            Ok(())
        })
        .into_service_input();
        let re = repository
            .execute(services::DERIVATION_CREATE, json!({ "pid": "1.5.1" }), Some(input))
            .await
            .unwrap();
        assert_eq!(re["cid"], "1.5.1.2");

        let request = &server.await.unwrap()[0];
        assert!(request
            .head
            .starts_with("post /api/execute/dataset.derivation.create "));
        let boundary = request
            .head
            .lines()
            .find_map(|l| l.strip_prefix("content-type: multipart/form-data; boundary="))
            .unwrap()
            .to_string();
        let body = &request.body;
        let args_at = find(body, b"name=\"args\"").unwrap();
        let input_at = find(body, b"name=\"input\"; filename=\"1.dcm\"").unwrap();
        assert!(args_at < input_at);

        let part = &body[input_at..];
        let start = find(part, b"\r\n\r\n").unwrap() + 4;
        let part_head = String::from_utf8_lossy(&part[..start]).to_lowercase();
        assert!(part_head.contains("content-type: application/gzip"));
        let end = find(&part[start..], format!("\r\n--{}", boundary).as_bytes()).unwrap();
        let mut content = Vec::new();
        GzDecoder::new(&part[start..start + end])
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content, expected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_early_rejection_reports_server_status() {
        let (addr, server) = reject_early("401 Unauthorized", "denied").await;
        let repository = with_token(addr).await;

        // large enough to fill every buffer between producer and socket
        let input = ArchiveInput::new("big.dcm", 0, |out: &mut dyn Write| {
            let block: Vec<u8> = (0..1024 * 1024u32)
                .map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8)
                .collect();
            for _ in 0..8 {
                out.write_all(&block)?;
            }
            Ok(())
        })
        .into_service_input();
        let err = tokio::time::timeout(
            Duration::from_secs(60),
            repository.execute(services::DICOM_INGEST, json!({ "cid": "1.5" }), Some(input)),
        )
        .await
        .expect("upload did not finish")
        .unwrap_err();

        match err {
            RepositoryError::Status { status, body } => {
                assert_eq!(status.as_u16(), 401);
                assert_eq!(body, "denied");
            }
            other => panic!("unexpected error: {}", snafu::Report::from_error(other)),
        }
        server.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_producer_failure_wins_over_response() {
        let (addr, server) = reject_early("400 Bad Request", "truncated archive").await;
        let repository = with_token(addr).await;

        let input = ArchiveInput::new("2.dcm", 6, |out: &mut dyn Write| {
            out.write_all(&[0u8; 132])?;
            Err("element encoding failed".into())
        })
        .into_service_input();
        let err = repository
            .execute(services::DICOM_INGEST, json!({ "cid": "1.5" }), Some(input))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::Input {
                source: InputError::ProducerFailed { .. }
            }
        ));
        server.await.unwrap();
    }
}
