use anyhow::Context;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AuthInterceptor, RefreshCoordinator, TokenRefresher, TokenStore};
use crate::error::{ClientError, Result};
use crate::events::EventSink;

/// Body of a dispatched request
///
/// Held as owned data so the request can be rebuilt for a replay.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    Multipart(MultipartBody),
}

/// Replayable multipart payload
#[derive(Debug, Clone, Default)]
pub struct MultipartBody {
    fields: Vec<(String, String)>,
    files: Vec<FilePart>,
}

#[derive(Debug, Clone)]
struct FilePart {
    name: String,
    file_name: String,
    mime: Option<String>,
    data: Bytes,
}

impl MultipartBody {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn file(
        mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        mime: Option<&str>,
        data: impl Into<Bytes>,
    ) -> Self {
        self.files.push(FilePart {
            name: name.into(),
            file_name: file_name.into(),
            mime: mime.map(str::to_string),
            data: data.into(),
        });
        self
    }

    /// Build a fresh form for one attempt
    fn to_form(&self) -> Result<Form> {
        let mut form = Form::new();
        for (name, value) in &self.fields {
            form = form.text(name.clone(), value.clone());
        }
        for file in &self.files {
            let mut part = Part::bytes(file.data.to_vec()).file_name(file.file_name.clone());
            if let Some(mime) = &file.mime {
                part = part
                    .mime_str(mime)
                    .map_err(|e| ClientError::Internal(format!("Invalid MIME type {}: {}", mime, e)))?;
            }
            form = form.part(file.name.clone(), part);
        }
        Ok(form)
    }
}

/// A request against the backend, relative to the base URL
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
    retried: bool,
    quiet: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
            retried: false,
            quiet: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, params: &[(&str, &str)]) -> Self {
        self.query
            .extend(params.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn multipart(mut self, body: MultipartBody) -> Self {
        self.body = RequestBody::Multipart(body);
        self
    }

    /// Let a 401 through to the caller instead of refreshing
    ///
    /// Used by the auth endpoints themselves.
    pub fn skip_refresh(mut self) -> Self {
        self.retried = true;
        self
    }

    /// Log failures without emitting an error notice
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }
}

/// Base-URL-bound HTTP client with the auth interceptors wired in
pub struct CrmHttpClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    base_url: Url,

    interceptor: AuthInterceptor,

    store: Arc<dyn TokenStore>,

    events: EventSink,
}

impl CrmHttpClient {
    /// Create a new HTTP client
    pub fn new(
        base_url: Url,
        store: Arc<dyn TokenStore>,
        events: EventSink,
        connect_timeout: u64,
        request_timeout: u64,
    ) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = normalize_base_url(base_url);
        let refresher =
            TokenRefresher::new(client.clone(), &base_url, store.clone(), events.clone())?;
        let coordinator = Arc::new(RefreshCoordinator::new(refresher));
        let interceptor = AuthInterceptor::new(store.clone(), coordinator, events.clone());

        Ok(Self {
            client,
            base_url,
            interceptor,
            store,
            events,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        self.interceptor.coordinator()
    }

    /// Dispatch a request, refreshing and replaying once on a 401
    pub async fn send(&self, request: ApiRequest) -> Result<Response> {
        tracing::debug!(
            method = %request.method,
            path = %request.path,
            "Sending HTTP request"
        );

        let response = self.execute(&request, None).await?;

        if response.status() == StatusCode::UNAUTHORIZED && !request.retried {
            let token = self.interceptor.on_unauthorized().await?;

            let mut replay = request;
            replay.retried = true;
            tracing::debug!(
                method = %replay.method,
                path = %replay.path,
                "Replaying request with refreshed token"
            );
            let response = self.execute(&replay, Some(&token)).await?;
            return self.interceptor.on_response(response, !replay.quiet).await;
        }

        self.interceptor.on_response(response, !request.quiet).await
    }

    /// Dispatch and decode the JSON body
    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        let response = self.send(request).await?;
        response.json().await.map_err(ClientError::from)
    }

    /// Dispatch and return the body as JSON, `Null` for an empty body
    pub async fn send_value(&self, request: ApiRequest) -> Result<Value> {
        let response = self.send(request).await?;
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| ClientError::Internal(format!("Failed to parse response body: {}", e)))
    }

    /// One attempt. `token` overrides the stored access token.
    async fn execute(&self, request: &ApiRequest, token: Option<&str>) -> Result<Response> {
        let url = self.url_for(&request.path)?;

        let mut builder = self.client.request(request.method.clone(), url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(body) => builder.json(body),
            RequestBody::Multipart(body) => builder.multipart(body.to_form()?),
        };
        builder = match token {
            Some(token) => builder.bearer_auth(token),
            None => self.interceptor.on_request(builder),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| self.interceptor.on_transport_error(e, !request.quiet))?;

        tracing::debug!(status = %response.status(), "Received HTTP response");
        Ok(response)
    }

    fn url_for(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| ClientError::Config(format!("Invalid request path {}: {}", path, e)))
    }
}

/// Ensure the base URL ends with `/` so relative joins append
pub fn normalize_base_url(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryTokenStore;

    fn client(base: &str) -> CrmHttpClient {
        CrmHttpClient::new(
            Url::parse(base).unwrap(),
            Arc::new(MemoryTokenStore::new()),
            EventSink::new(),
            30,
            60,
        )
        .unwrap()
    }

    #[test]
    fn test_normalize_base_url() {
        let url = normalize_base_url(Url::parse("https://crm.example.com/backend").unwrap());
        assert_eq!(url.as_str(), "https://crm.example.com/backend/");

        let url = normalize_base_url(Url::parse("http://127.0.0.1:8000").unwrap());
        assert_eq!(url.as_str(), "http://127.0.0.1:8000/");
    }

    #[test]
    fn test_paths_join_under_base() {
        let client = client("https://crm.example.com/backend");
        assert_eq!(
            client.url_for("/crm-api/flows/flows/").unwrap().as_str(),
            "https://crm.example.com/backend/crm-api/flows/flows/"
        );
    }

    #[test]
    fn test_request_builder() {
        let request = ApiRequest::get("crm-api/analytics/reports/")
            .query(&[("period", "7d"), ("page", "2")]);
        assert_eq!(request.method, Method::GET);
        assert_eq!(
            request.query,
            vec![
                ("period".to_string(), "7d".to_string()),
                ("page".to_string(), "2".to_string())
            ]
        );
        assert!(!request.retried);
        assert!(request.skip_refresh().retried);
    }

    #[test]
    fn test_multipart_rebuilds_each_time() {
        let body = MultipartBody::new()
            .text("name", "logo")
            .file("file", "logo.png", Some("image/png"), vec![0x89, b'P', b'N', b'G']);
        assert!(body.to_form().is_ok());
        assert!(body.to_form().is_ok());

        let bad = MultipartBody::new().file("file", "x", Some("not a mime"), Vec::<u8>::new());
        assert!(bad.to_form().is_err());
    }
}
