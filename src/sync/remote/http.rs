use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ETAG, IF_MATCH, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::json;

use super::{
    BlobStore, MetadataResponse, PutResponse, RemoteError, RemoteMetadata, RemoteObject, Result,
};

const API_KEY_HEADER: &str = "X-API-Key";

/// Client for the backup service at `{server}/apps/{app}/backups`
pub struct HttpBlobStore {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpBlobStore {
    pub fn new(server_url: &str, app_id: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let server_url = server_url.trim_end_matches('/');
        if !server_url.starts_with("http://") && !server_url.starts_with("https://") {
            return Err(RemoteError::InvalidUrl(
                "URL must start with http:// or https://".to_string(),
            ));
        }
        if app_id.is_empty() || app_id.contains('/') {
            return Err(RemoteError::InvalidUrl(format!("invalid app id '{}'", app_id)));
        }

        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: format!("{}/apps/{}/backups", server_url, app_id),
            api_key: api_key.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(API_KEY_HEADER, &self.api_key)
    }
}

fn quote_etag(etag: &str) -> String {
    format!("\"{}\"", etag.trim_matches('"'))
}

fn header_etag(response: &Response) -> Option<String> {
    response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim_start_matches("W/").trim_matches('"').to_string())
}

fn header_modified(response: &Response) -> Option<DateTime<Utc>> {
    response
        .headers()
        .get(LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| DateTime::parse_from_rfc2822(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Map error statuses; successful responses pass through
async fn check_status(response: Response, key: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RemoteError::Unauthorized),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => Err(RemoteError::Conflict),
        StatusCode::NOT_FOUND => Err(RemoteError::NotFound(key.to_string())),
        status if status.is_server_error() => Err(RemoteError::Server {
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        }),
        status => Err(RemoteError::Payload {
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        }),
    }
}

/// Writes answer with a JSON body; fall back to headers for bare responses
async fn put_response(response: Response) -> Result<PutResponse> {
    let etag = header_etag(&response);
    let modified = header_modified(&response);
    let bytes = response.bytes().await?;

    if let Ok(parsed) = serde_json::from_slice::<PutResponse>(&bytes) {
        return Ok(parsed);
    }
    match etag {
        Some(etag) => Ok(PutResponse {
            etag,
            modified: modified.unwrap_or_else(Utc::now),
        }),
        None => Err(RemoteError::Payload {
            status: 200,
            message: "write response carried no ETag".to_string(),
        }),
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn get_metadata(&self, key: &str, if_none_match: Option<&str>) -> Result<MetadataResponse> {
        let mut request = self.authed(self.client.get(self.url(&format!("{}/meta", key))));
        if let Some(etag) = if_none_match {
            request = request.header(IF_NONE_MATCH, quote_etag(etag));
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_MODIFIED => return Ok(MetadataResponse::NotModified),
            StatusCode::NOT_FOUND => return Ok(MetadataResponse::NotFound),
            _ => {}
        }

        let response = check_status(response, key).await?;
        let mut metadata: RemoteMetadata = response.json().await?;
        metadata.etag = metadata.etag.trim_matches('"').to_string();
        log::debug!("Remote: {} is at {}", key, metadata.etag);
        Ok(MetadataResponse::Found(metadata))
    }

    async fn get(&self, key: &str) -> Result<Option<RemoteObject>> {
        let response = self.authed(self.client.get(self.url(key))).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = check_status(response, key).await?;
        let etag = header_etag(&response).ok_or_else(|| RemoteError::Payload {
            status: 200,
            message: "download carried no ETag".to_string(),
        })?;
        let modified = header_modified(&response);
        let body = response.bytes().await?.to_vec();

        log::debug!("Remote: downloaded {} ({} bytes)", key, body.len());
        Ok(Some(RemoteObject {
            body,
            etag,
            modified,
        }))
    }

    async fn put(&self, key: &str, body: Vec<u8>, expected_etag: Option<&str>) -> Result<PutResponse> {
        let size = body.len();
        let mut request = self
            .authed(self.client.put(self.url(key)))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(etag) = expected_etag {
            request = request.header(IF_MATCH, quote_etag(etag));
        }

        let response = check_status(request.send().await?, key).await?;
        let put = put_response(response).await?;
        log::debug!("Remote: uploaded {} ({} bytes) as {}", key, size, put.etag);
        Ok(put)
    }

    async fn create(&self, name: &str, body: Vec<u8>) -> Result<PutResponse> {
        let part = Part::bytes(body)
            .file_name(name.to_string())
            .mime_str("application/json")?;
        let form = Form::new().part("file", part);

        let response = self
            .authed(self.client.post(self.url("")))
            .multipart(form)
            .send()
            .await?;
        put_response(check_status(response, name).await?).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let response = self.authed(self.client.delete(self.url(key))).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response, key).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RemoteMetadata>> {
        let response = self.authed(self.client.get(self.url("list"))).send().await?;
        let response = check_status(response, "list").await?;
        Ok(response.json().await?)
    }

    async fn restore_named(&self, name: &str, target: &str) -> Result<PutResponse> {
        let response = self
            .authed(self.client.post(self.url(&format!("{}/restore", name))))
            .json(&json!({ "target": target }))
            .send()
            .await?;
        put_response(check_status(response, name).await?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use axum::body::Bytes;
    use axum::extract::{Path, State};
    use axum::http::{header, HeaderMap, StatusCode as AxumStatus};
    use axum::response::{IntoResponse, Response as AxumResponse};
    use axum::routing::get;
    use axum::{Json, Router};

    const KEY: &str = "secret";

    #[derive(Default)]
    struct Server {
        blobs: HashMap<String, (Vec<u8>, u64)>,
        version: u64,
    }

    type Shared = Arc<Mutex<Server>>;

    fn authorized(headers: &HeaderMap) -> bool {
        headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) == Some(KEY)
    }

    fn etag_header(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim_matches('"').to_string())
    }

    async fn read_blob(
        State(state): State<Shared>,
        Path((_app, file)): Path<(String, String)>,
        headers: HeaderMap,
    ) -> AxumResponse {
        if !authorized(&headers) {
            return AxumStatus::UNAUTHORIZED.into_response();
        }
        if file == "flaky" {
            return (AxumStatus::SERVICE_UNAVAILABLE, "try later").into_response();
        }
        let server = state.lock().unwrap();
        match server.blobs.get(&file) {
            Some((body, version)) => (
                [(header::ETAG, format!("\"v{}\"", version))],
                body.clone(),
            )
                .into_response(),
            None => AxumStatus::NOT_FOUND.into_response(),
        }
    }

    async fn write_blob(
        State(state): State<Shared>,
        Path((_app, file)): Path<(String, String)>,
        headers: HeaderMap,
        body: Bytes,
    ) -> AxumResponse {
        if !authorized(&headers) {
            return AxumStatus::UNAUTHORIZED.into_response();
        }
        let mut server = state.lock().unwrap();
        let current = server.blobs.get(&file).map(|(_, v)| format!("v{}", v));
        if let Some(expected) = etag_header(&headers, header::IF_MATCH) {
            if current.as_deref() != Some(expected.as_str()) {
                return AxumStatus::PRECONDITION_FAILED.into_response();
            }
        }
        server.version += 1;
        let version = server.version;
        server.blobs.insert(file, (body.to_vec(), version));
        Json(json!({ "etag": format!("v{}", version), "modified": Utc::now() })).into_response()
    }

    async fn blob_meta(
        State(state): State<Shared>,
        Path((_app, file)): Path<(String, String)>,
        headers: HeaderMap,
    ) -> AxumResponse {
        if !authorized(&headers) {
            return AxumStatus::UNAUTHORIZED.into_response();
        }
        let server = state.lock().unwrap();
        let Some((body, version)) = server.blobs.get(&file) else {
            return AxumStatus::NOT_FOUND.into_response();
        };
        let etag = format!("v{}", version);
        if etag_header(&headers, header::IF_NONE_MATCH).as_deref() == Some(etag.as_str()) {
            return AxumStatus::NOT_MODIFIED.into_response();
        }
        Json(json!({
            "name": file,
            "etag": etag,
            "modified": Utc::now(),
            "size": body.len(),
        }))
        .into_response()
    }

    async fn list_blobs(State(state): State<Shared>) -> AxumResponse {
        let server = state.lock().unwrap();
        let items: Vec<_> = server
            .blobs
            .iter()
            .map(|(name, (body, version))| {
                json!({ "name": name, "etag": format!("v{}", version), "modified": Utc::now(), "size": body.len() })
            })
            .collect();
        Json(items).into_response()
    }

    async fn spawn_server() -> (HttpBlobStore, Shared) {
        let state: Shared = Arc::new(Mutex::new(Server::default()));
        let app = Router::new()
            .route("/apps/{app}/backups/list", get(list_blobs))
            .route("/apps/{app}/backups/{file}", get(read_blob).put(write_blob))
            .route("/apps/{app}/backups/{file}/meta", get(blob_meta))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = HttpBlobStore::new(
            &format!("http://{}", addr),
            "mnemo",
            KEY,
            Duration::from_secs(5),
        )
        .unwrap();
        (client, state)
    }

    #[test]
    fn test_rejects_bad_urls() {
        let err = HttpBlobStore::new("ftp://x", "mnemo", KEY, Duration::from_secs(1)).err();
        assert!(matches!(err, Some(RemoteError::InvalidUrl(_))));
        let err = HttpBlobStore::new("https://x", "a/b", KEY, Duration::from_secs(1)).err();
        assert!(matches!(err, Some(RemoteError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_missing_blob_is_not_an_error() {
        let (client, _state) = spawn_server().await;
        assert_eq!(
            client.get_metadata("sync.json", None).await.unwrap(),
            MetadataResponse::NotFound
        );
        assert!(client.get("sync.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_get_and_not_modified() {
        let (client, _state) = spawn_server().await;

        let put = client.put("sync.json", b"{}".to_vec(), None).await.unwrap();
        assert_eq!(put.etag, "v1");

        let object = client.get("sync.json").await.unwrap().unwrap();
        assert_eq!(object.body, b"{}");
        assert_eq!(object.etag, "v1");

        assert_eq!(
            client.get_metadata("sync.json", Some("v1")).await.unwrap(),
            MetadataResponse::NotModified
        );
        match client.get_metadata("sync.json", Some("v0")).await.unwrap() {
            MetadataResponse::Found(meta) => {
                assert_eq!(meta.etag, "v1");
                assert_eq!(meta.size, 2);
            }
            other => panic!("expected metadata, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_etag_is_a_conflict() {
        let (client, _state) = spawn_server().await;
        let first = client.put("sync.json", b"1".to_vec(), None).await.unwrap();
        client
            .put("sync.json", b"2".to_vec(), Some(&first.etag))
            .await
            .unwrap();

        let stale = client.put("sync.json", b"3".to_vec(), Some(&first.etag)).await;
        assert!(matches!(stale, Err(RemoteError::Conflict)));
        assert_eq!(client.get("sync.json").await.unwrap().unwrap().body, b"2");
    }

    #[tokio::test]
    async fn test_status_classification() {
        let (client, _state) = spawn_server().await;

        let flaky = client.get("flaky").await.unwrap_err();
        assert!(matches!(flaky, RemoteError::Server { status: 503, .. }));
        assert!(flaky.is_transient());

        let server_url = client.base_url.replace("/apps/mnemo/backups", "");
        let bad_key =
            HttpBlobStore::new(&server_url, "mnemo", "wrong", Duration::from_secs(5)).unwrap();
        let denied = bad_key.get("sync.json").await.unwrap_err();
        assert!(matches!(denied, RemoteError::Unauthorized));
        assert!(!denied.is_transient());
    }

    #[tokio::test]
    async fn test_list() {
        let (client, _state) = spawn_server().await;
        client.put("a.json", b"a".to_vec(), None).await.unwrap();
        client.put("b.json", b"bb".to_vec(), None).await.unwrap();

        let mut names: Vec<String> = client
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.json", "b.json"]);
    }
}
