use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::{multipart, Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

use crate::core::config::Credentials;
use crate::core::error::{excerpt, is_not_found, PipelineError};

pub const PAGE_SIZE: usize = 200;

const AUTH_TIMEOUT: Duration = Duration::from_secs(30);
const LIST_TIMEOUT: Duration = Duration::from_secs(60);
const RECORD_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Filter/sort/expand for a record listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordQuery {
    pub filter: Option<String>,
    pub sort: Option<String>,
    pub expand: Option<String>,
}

impl RecordQuery {
    pub fn filter(filter: impl Into<String>) -> Self {
        Self {
            filter: Some(filter.into()),
            ..Default::default()
        }
    }

    pub fn sort(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(sort.into());
        self
    }

    pub fn expand(mut self, expand: impl Into<String>) -> Self {
        self.expand = Some(expand.into());
        self
    }
}

/// A file sent as one multipart field.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub field: String,
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// The record store, seen as a black box. Listing walks every page.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn list(&self, collection: &str, query: &RecordQuery) -> Result<Vec<Value>>;
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>>;
    async fn create(&self, collection: &str, fields: Value) -> Result<Value>;
    async fn create_with_file(
        &self,
        collection: &str,
        fields: &[(&str, String)],
        file: FileUpload,
    ) -> Result<Value>;
    async fn update(&self, collection: &str, id: &str, fields: Value) -> Result<Value>;
    async fn update_file(&self, collection: &str, id: &str, file: FileUpload) -> Result<Value>;
    async fn download_file(&self, collection: &str, id: &str, file_name: &str) -> Result<Vec<u8>>;
}

pub async fn list_as<T: DeserializeOwned>(
    backend: &dyn Backend,
    collection: &str,
    query: &RecordQuery,
) -> Result<Vec<T>> {
    backend
        .list(collection, query)
        .await?
        .into_iter()
        .map(|v| serde_json::from_value(v).with_context(|| format!("Unexpected {} record shape", collection)))
        .collect()
}

pub async fn get_as<T: DeserializeOwned>(
    backend: &dyn Backend,
    collection: &str,
    id: &str,
) -> Result<Option<T>> {
    match backend.get(collection, id).await? {
        Some(v) => Ok(Some(
            serde_json::from_value(v).with_context(|| format!("Unexpected {} record shape", collection))?,
        )),
        None => Ok(None),
    }
}

// --- PocketBase ---

#[derive(Deserialize)]
struct AuthResponse {
    token: Option<String>,
}

#[derive(Deserialize)]
struct ListPage {
    #[serde(default)]
    items: Vec<Value>,
}

pub struct PocketBaseClient {
    base_url: String,
    token: String,
    client: Client,
}

impl PocketBaseClient {
    /// Password auth against the superuser collection.
    pub async fn connect(creds: &Credentials) -> Result<Self> {
        let client = Client::new();
        let base_url = creds.base_url.trim_end_matches('/').to_string();
        let url = format!("{}/api/collections/_superusers/auth-with-password", base_url);
        info!("Authenticating to {}", base_url);

        let resp = client
            .post(&url)
            .json(&json!({ "identity": creds.email, "password": creds.password }))
            .timeout(AUTH_TIMEOUT)
            .send()
            .await
            .context("Failed to send auth request")?;
        let resp = check(resp, "POST", &url).await.context("Authentication failed")?;
        let auth: AuthResponse = resp.json().await.context("Failed to parse auth response")?;
        let token = auth
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow!("No token in auth response"))?;

        Ok(Self {
            base_url,
            token,
            client,
        })
    }

    fn records_url(&self, collection: &str) -> String {
        format!("{}/api/collections/{}/records", self.base_url, collection)
    }

    fn authed(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
    }

    fn page_url(&self, collection: &str, query: &RecordQuery, page: usize) -> Result<Url> {
        let mut url = Url::parse(&self.records_url(collection))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("page", &page.to_string());
            pairs.append_pair("perPage", &PAGE_SIZE.to_string());
            if let Some(f) = &query.filter {
                pairs.append_pair("filter", f);
            }
            if let Some(s) = &query.sort {
                pairs.append_pair("sort", s);
            }
            if let Some(e) = &query.expand {
                pairs.append_pair("expand", e);
            }
        }
        Ok(url)
    }
}

async fn check(resp: Response, method: &'static str, url: &str) -> Result<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(PipelineError::Http {
        method,
        url: url.to_string(),
        status,
        body: excerpt(&body),
    }
    .into())
}

fn file_part(file: FileUpload) -> Result<(String, multipart::Part)> {
    let part = multipart::Part::bytes(file.bytes)
        .file_name(file.file_name)
        .mime_str(&file.mime)
        .context("Invalid mime type")?;
    Ok((file.field, part))
}

#[async_trait]
impl Backend for PocketBaseClient {
    async fn list(&self, collection: &str, query: &RecordQuery) -> Result<Vec<Value>> {
        let mut records = Vec::new();
        let mut page = 1;
        loop {
            let url = self.page_url(collection, query, page)?;
            debug!("GET {}", url);
            let resp = self
                .authed(Method::GET, url.as_str())
                .timeout(LIST_TIMEOUT)
                .send()
                .await
                .with_context(|| format!("Failed to list {}", collection))?;
            let resp = check(resp, "GET", url.as_str()).await?;
            let data: ListPage = resp
                .json()
                .await
                .with_context(|| format!("Failed to parse {} page {}", collection, page))?;
            let n = data.items.len();
            records.extend(data.items);
            if n < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        debug!("Fetched {} {} records", records.len(), collection);
        Ok(records)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let url = format!("{}/{}", self.records_url(collection), id);
        let resp = self
            .authed(Method::GET, &url)
            .timeout(RECORD_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}/{}", collection, id))?;
        match check(resp, "GET", &url).await {
            Ok(resp) => Ok(Some(resp.json().await?)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create(&self, collection: &str, fields: Value) -> Result<Value> {
        let url = self.records_url(collection);
        let resp = self
            .authed(Method::POST, &url)
            .json(&fields)
            .timeout(RECORD_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("Failed to create {} record", collection))?;
        Ok(check(resp, "POST", &url).await?.json().await?)
    }

    async fn create_with_file(
        &self,
        collection: &str,
        fields: &[(&str, String)],
        file: FileUpload,
    ) -> Result<Value> {
        let url = self.records_url(collection);
        let mut form = multipart::Form::new();
        for (name, value) in fields {
            form = form.text(name.to_string(), value.clone());
        }
        let (name, part) = file_part(file)?;
        form = form.part(name, part);

        let resp = self
            .authed(Method::POST, &url)
            .multipart(form)
            .timeout(UPLOAD_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("Failed to upload {} record", collection))?;
        Ok(check(resp, "POST", &url).await?.json().await?)
    }

    async fn update(&self, collection: &str, id: &str, fields: Value) -> Result<Value> {
        let url = format!("{}/{}", self.records_url(collection), id);
        let resp = self
            .authed(Method::PATCH, &url)
            .json(&fields)
            .timeout(RECORD_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("Failed to update {}/{}", collection, id))?;
        Ok(check(resp, "PATCH", &url).await?.json().await?)
    }

    async fn update_file(&self, collection: &str, id: &str, file: FileUpload) -> Result<Value> {
        let url = format!("{}/{}", self.records_url(collection), id);
        let (name, part) = file_part(file)?;
        let form = multipart::Form::new().part(name, part);
        let resp = self
            .authed(Method::PATCH, &url)
            .multipart(form)
            .timeout(UPLOAD_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("Failed to upload file to {}/{}", collection, id))?;
        Ok(check(resp, "PATCH", &url).await?.json().await?)
    }

    async fn download_file(&self, collection: &str, id: &str, file_name: &str) -> Result<Vec<u8>> {
        let url = format!("{}/api/files/{}/{}/{}", self.base_url, collection, id, file_name);
        let resp = self
            .authed(Method::GET, &url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("Failed to download {}", file_name))?;
        let bytes = check(resp, "GET", &url).await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}
