use std::{future::Future, pin::Pin};

use futures::StreamExt;
use reqwest::{Client, StatusCode, header::CONTENT_TYPE};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::error::{Result, Stage, UploadError};
use crate::rest_types::{
    API_ARG_HEADER, AppendArg, ApiErrorBody, CommitInfo, FileMetadata, FinishArg,
    StartSessionArg, StartSessionResponse, UploadCursor,
};
use crate::session::SessionId;

pub const DEFAULT_CONTENT_BASE_URL: &str = "https://content.dropboxapi.com/2/";

const START_SESSION_ROUTE: &str = "files/upload_session/start";
const APPEND_ROUTE: &str = "files/upload_session/append_v2";
const FINISH_SESSION_ROUTE: &str = "files/upload_session/finish";

/// Granularity of progress updates while a chunk body streams.
const SUB_CHUNK_SIZE: usize = 64 * 1024;

pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// The three session calls plus the abandon hook.
pub trait UploadApi: Sync {
    fn start_session(&self) -> ApiFuture<'_, SessionId>;

    /// Sends `data` at `cursor.offset`. Every body slice handed to the
    /// transport is reported on `progress` as a byte count.
    fn append(
        &self,
        cursor: UploadCursor,
        data: Vec<u8>,
        progress: mpsc::UnboundedSender<u64>,
    ) -> ApiFuture<'_, ()>;

    fn finish(&self, cursor: UploadCursor, commit: CommitInfo) -> ApiFuture<'_, FileMetadata>;

    /// Best-effort close of a session that will never be committed.
    fn abandon(&self, cursor: UploadCursor) -> ApiFuture<'_, ()>;
}

/// Serializes a `Dropbox-API-Arg` value. Header values must be visible
/// ASCII, so DEL and everything outside ASCII is written as `\uXXXX` escapes.
pub fn header_arg<T: Serialize>(stage: Stage, arg: &T) -> Result<String> {
    let json = serde_json::to_string(arg).map_err(|e| UploadError::Network {
        stage,
        file: String::new(),
        message: format!("unable to encode request argument: {e}"),
    })?;

    let mut escaped = String::with_capacity(json.len());
    for c in json.chars() {
        if c.is_ascii() && c != '\u{7f}' {
            escaped.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                escaped.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    Ok(escaped)
}

/// Maps a non-2xx response onto the error kinds callers distinguish.
pub fn classify_failure(
    stage: Stage,
    status: StatusCode,
    body: &str,
    commit_path: Option<&str>,
) -> UploadError {
    let summary = serde_json::from_str::<ApiErrorBody>(body)
        .map(|b| b.error_summary)
        .unwrap_or_else(|_| body.trim().to_string());

    if status == StatusCode::UNAUTHORIZED
        || summary.starts_with("invalid_access_token")
        || summary.starts_with("expired_access_token")
    {
        return UploadError::Auth {
            stage,
            message: format!("{} - {}", status, summary),
        };
    }

    if let Some(path) = commit_path
        && status == StatusCode::CONFLICT
        && summary.starts_with("path/conflict")
    {
        return UploadError::Conflict {
            path: path.to_string(),
            message: summary,
        };
    }

    UploadError::Network {
        stage,
        file: String::new(),
        message: format!("{} - {}", status, summary),
    }
}

fn transport_error(stage: Stage, err: reqwest::Error) -> UploadError {
    UploadError::Network {
        stage,
        file: String::new(),
        message: err.to_string(),
    }
}

pub(crate) fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

pub struct DropboxClient {
    client: Client,
    content_base_url: Url,
    access_token: String,
}

impl DropboxClient {
    pub fn new(content_base_url: Url, access_token: String) -> Self {
        Self {
            client: Client::new(),
            content_base_url: with_trailing_slash(content_base_url),
            access_token,
        }
    }

    fn route(&self, stage: Stage, route: &str) -> Result<Url> {
        self.content_base_url
            .join(route)
            .map_err(|e| UploadError::Network {
                stage,
                file: String::new(),
                message: format!("failed to construct {route} URL: {e}"),
            })
    }

    async fn post_content<A: Serialize>(
        &self,
        stage: Stage,
        route: &str,
        arg: &A,
        body: reqwest::Body,
        commit_path: Option<&str>,
    ) -> Result<String> {
        let url = self.route(stage, route)?;
        let arg = header_arg(stage, arg)?;

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .header(API_ARG_HEADER, arg)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| transport_error(stage, e))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(classify_failure(stage, status, &text, commit_path));
        }

        Ok(text)
    }
}

impl UploadApi for DropboxClient {
    fn start_session(&self) -> ApiFuture<'_, SessionId> {
        Box::pin(async move {
            let text = self
                .post_content(
                    Stage::Start,
                    START_SESSION_ROUTE,
                    &StartSessionArg { close: false },
                    reqwest::Body::from(Vec::new()),
                    None,
                )
                .await?;

            let response: StartSessionResponse =
                serde_json::from_str(&text).map_err(|e| UploadError::Network {
                    stage: Stage::Start,
                    file: String::new(),
                    message: format!("invalid start response: {e}; body={text}"),
                })?;

            debug!(session_id = %response.session_id, "upload session opened");
            Ok(SessionId::new(response.session_id))
        })
    }

    fn append(
        &self,
        cursor: UploadCursor,
        data: Vec<u8>,
        progress: mpsc::UnboundedSender<u64>,
    ) -> ApiFuture<'_, ()> {
        Box::pin(async move {
            let chunks: Vec<Vec<u8>> = data
                .chunks(SUB_CHUNK_SIZE)
                .map(|chunk| chunk.to_vec())
                .collect();

            let stream = futures::stream::iter(chunks).map(move |chunk| {
                let _ = progress.send(chunk.len() as u64);
                Ok::<_, std::io::Error>(chunk)
            });

            let arg = AppendArg {
                cursor,
                close: false,
            };

            self.post_content(
                Stage::Append,
                APPEND_ROUTE,
                &arg,
                reqwest::Body::wrap_stream(stream),
                None,
            )
            .await?;

            Ok(())
        })
    }

    fn finish(&self, cursor: UploadCursor, commit: CommitInfo) -> ApiFuture<'_, FileMetadata> {
        Box::pin(async move {
            let path = commit.path.clone();
            let arg = FinishArg { cursor, commit };

            let text = self
                .post_content(
                    Stage::Finish,
                    FINISH_SESSION_ROUTE,
                    &arg,
                    reqwest::Body::from(Vec::new()),
                    Some(&path),
                )
                .await?;

            serde_json::from_str(&text).map_err(|e| UploadError::Network {
                stage: Stage::Finish,
                file: String::new(),
                message: format!("invalid finish response: {e}; body={text}"),
            })
        })
    }

    fn abandon(&self, cursor: UploadCursor) -> ApiFuture<'_, ()> {
        Box::pin(async move {
            let arg = AppendArg {
                cursor,
                close: true,
            };

            self.post_content(
                Stage::Append,
                APPEND_ROUTE,
                &arg,
                reqwest::Body::from(Vec::new()),
                None,
            )
            .await?;

            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_arg_escapes_non_ascii() {
        let arg = CommitInfo::add("/galeria/año nuevo 🎉.jpg".to_string());
        let header = header_arg(Stage::Finish, &arg).unwrap();

        assert!(header.is_ascii());
        assert!(header.contains("a\\u00f1o"));
        assert!(header.contains("\\ud83c\\udf89"));

        let decoded: serde_json::Value = serde_json::from_str(&header).unwrap();
        assert_eq!(decoded["path"], "/galeria/año nuevo 🎉.jpg");
    }

    #[test]
    fn header_arg_escapes_delete() {
        let arg = CommitInfo::add("/galeria/a\u{7f}b.jpg".to_string());
        let header = header_arg(Stage::Finish, &arg).unwrap();

        assert!(header.contains("a\\u007fb"));
        assert!(reqwest::header::HeaderValue::from_str(&header).is_ok());

        let decoded: serde_json::Value = serde_json::from_str(&header).unwrap();
        assert_eq!(decoded["path"], "/galeria/a\u{7f}b.jpg");
    }

    #[test]
    fn unauthorized_is_auth_error() {
        let err = classify_failure(
            Stage::Start,
            StatusCode::UNAUTHORIZED,
            r#"{"error_summary": "expired_access_token/..", "error": {".tag": "expired_access_token"}}"#,
            None,
        );
        assert!(err.is_auth());
    }

    #[test]
    fn incorrect_offset_is_network_error() {
        let err = classify_failure(
            Stage::Append,
            StatusCode::CONFLICT,
            r#"{"error_summary": "incorrect_offset/..", "error": {".tag": "incorrect_offset"}}"#,
            None,
        );
        match err {
            UploadError::Network { stage, message, .. } => {
                assert_eq!(stage, Stage::Append);
                assert!(message.contains("incorrect_offset"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn commit_path_conflict_is_conflict_error() {
        let err = classify_failure(
            Stage::Finish,
            StatusCode::CONFLICT,
            r#"{"error_summary": "path/conflict/file/..", "error": {}}"#,
            Some("/galeria/a.jpg"),
        );
        assert!(matches!(err, UploadError::Conflict { ref path, .. } if path == "/galeria/a.jpg"));
    }

    #[test]
    fn plain_text_bodies_are_kept() {
        let err = classify_failure(
            Stage::Start,
            StatusCode::BAD_REQUEST,
            "Error in call to API function \"files/upload_session/start\"",
            None,
        );
        assert!(err.to_string().contains("files/upload_session/start"));
    }

    #[test]
    fn base_url_gains_trailing_slash() {
        let url = with_trailing_slash(Url::parse("https://content.dropboxapi.com/2").unwrap());
        assert_eq!(
            url.join(START_SESSION_ROUTE).unwrap().as_str(),
            "https://content.dropboxapi.com/2/files/upload_session/start"
        );
    }

    struct RecordedRequest {
        path: String,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    }

    impl RecordedRequest {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str())
        }
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    fn decode_chunked(mut raw: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        loop {
            let line_end = find(raw, b"\r\n").unwrap();
            let size_line = std::str::from_utf8(&raw[..line_end]).unwrap();
            let size = usize::from_str_radix(size_line.split(';').next().unwrap().trim(), 16)
                .unwrap();
            raw = &raw[line_end + 2..];
            if size == 0 {
                return body;
            }
            body.extend_from_slice(&raw[..size]);
            raw = &raw[size + 2..];
        }
    }

    async fn read_request(stream: &mut tokio::net::TcpStream) -> RecordedRequest {
        use tokio::io::AsyncReadExt;

        let mut buf = Vec::new();
        let mut tmp = [0u8; 16 * 1024];
        let head_end = loop {
            let n = stream.read(&mut tmp).await.unwrap();
            assert!(n > 0, "connection closed before request head");
            buf.extend_from_slice(&tmp[..n]);
            if let Some(pos) = find(&buf, b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8(buf[..head_end].to_vec()).unwrap();
        let mut lines = head.split("\r\n");
        let path = lines
            .next()
            .and_then(|line| line.split(' ').nth(1))
            .unwrap()
            .to_string();
        let headers: Vec<(String, String)> = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        let mut request = RecordedRequest {
            path,
            headers,
            body: buf[head_end..].to_vec(),
        };

        if request
            .header("transfer-encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
        {
            while !request.body.ends_with(b"0\r\n\r\n") {
                let n = stream.read(&mut tmp).await.unwrap();
                assert!(n > 0, "connection closed mid body");
                request.body.extend_from_slice(&tmp[..n]);
            }
            request.body = decode_chunked(&request.body);
        } else {
            let len: usize = request
                .header("content-length")
                .map(|v| v.parse().unwrap())
                .unwrap_or(0);
            while request.body.len() < len {
                let n = stream.read(&mut tmp).await.unwrap();
                assert!(n > 0, "connection closed mid body");
                request.body.extend_from_slice(&tmp[..n]);
            }
        }
        request
    }

    /// Answers one request per connection with the given responses, in order.
    async fn serve(
        responses: Vec<(u16, &'static str)>,
    ) -> (Url, tokio::task::JoinHandle<Vec<RecordedRequest>>) {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut requests = Vec::new();
            for (status, body) in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                requests.push(read_request(&mut stream).await);
                let response = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.shutdown().await.unwrap();
            }
            requests
        });
        (Url::parse(&format!("http://{addr}/2")).unwrap(), handle)
    }

    #[tokio::test]
    async fn session_calls_send_arguments_in_header() {
        let (base_url, server) = serve(vec![
            (200, r#"{"session_id": "abc"}"#),
            (200, "null"),
            (
                200,
                r#"{"name": "photo.jpg", "id": "id:1", "path_display": "/galeria/photo.jpg", "size": 200000}"#,
            ),
        ])
        .await;
        let client = DropboxClient::new(base_url, "test-token".to_string());

        let session_id = client.start_session().await.unwrap();
        assert_eq!(session_id.as_str(), "abc");

        let data = vec![7u8; 3 * SUB_CHUNK_SIZE + 3392];
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let cursor = UploadCursor {
            session_id: "abc".to_string(),
            offset: 0,
        };
        client
            .append(cursor.clone(), data.clone(), progress_tx)
            .await
            .unwrap();
        let mut reported = Vec::new();
        while let Ok(bytes) = progress_rx.try_recv() {
            reported.push(bytes);
        }
        assert_eq!(reported, vec![65536, 65536, 65536, 3392]);

        let finished = UploadCursor {
            session_id: "abc".to_string(),
            offset: data.len() as u64,
        };
        let meta = client
            .finish(finished, CommitInfo::add("/galeria/photo.jpg".to_string()))
            .await
            .unwrap();
        assert_eq!(meta.size, Some(200_000));

        let requests = server.await.unwrap();
        assert_eq!(requests.len(), 3);
        for request in &requests {
            assert_eq!(request.header("authorization"), Some("Bearer test-token"));
            assert_eq!(
                request.header("content-type"),
                Some("application/octet-stream")
            );
        }

        assert_eq!(requests[0].path, "/2/files/upload_session/start");
        assert_eq!(requests[0].header(API_ARG_HEADER), Some(r#"{"close":false}"#));
        assert!(requests[0].body.is_empty());

        assert_eq!(requests[1].path, "/2/files/upload_session/append_v2");
        assert_eq!(
            requests[1].header(API_ARG_HEADER),
            Some(r#"{"cursor":{"session_id":"abc","offset":0},"close":false}"#)
        );
        assert_eq!(requests[1].body, data);

        assert_eq!(requests[2].path, "/2/files/upload_session/finish");
        let arg: serde_json::Value =
            serde_json::from_str(requests[2].header(API_ARG_HEADER).unwrap()).unwrap();
        assert_eq!(arg["cursor"]["offset"], 200_000);
        assert_eq!(arg["commit"]["path"], "/galeria/photo.jpg");
        assert_eq!(arg["commit"]["mode"], "add");
        assert!(requests[2].body.is_empty());
    }

    #[tokio::test]
    async fn unauthorized_response_is_auth_error() {
        let (base_url, server) = serve(vec![(
            401,
            r#"{"error_summary": "invalid_access_token/..", "error": {".tag": "invalid_access_token"}}"#,
        )])
        .await;
        let client = DropboxClient::new(base_url, "stale".to_string());

        let err = client.start_session().await.unwrap_err();
        assert!(err.is_auth(), "unexpected error: {err:?}");
        assert!(matches!(err, UploadError::Auth { stage: Stage::Start, .. }));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn abandon_sends_closing_append() {
        let (base_url, server) = serve(vec![(200, "null")]).await;
        let client = DropboxClient::new(base_url, "test-token".to_string());

        client
            .abandon(UploadCursor {
                session_id: "abc".to_string(),
                offset: 42,
            })
            .await
            .unwrap();

        let requests = server.await.unwrap();
        assert_eq!(requests[0].path, "/2/files/upload_session/append_v2");
        assert_eq!(
            requests[0].header(API_ARG_HEADER),
            Some(r#"{"cursor":{"session_id":"abc","offset":42},"close":true}"#)
        );
        assert!(requests[0].body.is_empty());
    }
}
