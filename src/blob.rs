//! Named byte blobs.
//!
//! [`ByteSource`] is all the loaders need: fetch the full contents of one
//! named blob. [`BlobStore`] adds the operational side used by the command
//! layer (upload, list). Two stores exist: a local directory, used for dry
//! runs and tests, and an Azure storage container reached over the REST API
//! with either a shared key or a SAS token.

use std::{
    collections::BTreeMap,
    fs,
    path::{Component, Path, PathBuf},
    time::Duration,
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::Utc;
use hmac::{Hmac, Mac};
use log::{debug, info};
use reqwest::{
    Method, Url,
    blocking::{Client, Response},
    header::{AUTHORIZATION, CONTENT_TYPE},
};
use serde::Deserialize;
use sha2::Sha256;

use crate::error::{LoadError, LoadResult};

pub const DEFAULT_CONTAINER: &str = "nppes";
const API_VERSION: &str = "2021-08-06";
const DEV_ACCOUNT: &str = "devstoreaccount1";
const DEV_ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
const DEV_BLOB_ENDPOINT: &str = "http://127.0.0.1:10000/devstoreaccount1";
const UPLOAD_CONTENT_TYPE: &str = "application/octet-stream";

pub trait ByteSource {
    /// Full contents of `name`, or `SourceUnavailable`.
    fn fetch(&self, name: &str) -> LoadResult<Vec<u8>>;
}

pub trait BlobStore: ByteSource {
    fn container(&self) -> &str;
    /// Writes `data` under `name`, replacing any existing blob.
    fn upload(&self, name: &str, data: &[u8]) -> LoadResult<()>;
    fn list(&self) -> LoadResult<Vec<String>>;
}

/// Blobs stored as files below a root directory.
#[derive(Debug, Clone)]
pub struct LocalDirStore {
    root: PathBuf,
    label: String,
}

impl LocalDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let label = root.display().to_string();
        Self { root, label }
    }

    fn path_for(&self, name: &str) -> LoadResult<PathBuf> {
        let relative = Path::new(name);
        let escapes = name.is_empty()
            || relative
                .components()
                .any(|component| !matches!(component, Component::Normal(_)));
        if escapes {
            return Err(LoadError::source_unavailable(
                name,
                "blob names must be relative paths without '..'",
            ));
        }
        Ok(self.root.join(relative))
    }
}

impl ByteSource for LocalDirStore {
    fn fetch(&self, name: &str) -> LoadResult<Vec<u8>> {
        let path = self.path_for(name)?;
        debug!("Reading blob '{name}' from {path:?}");
        fs::read(&path).map_err(|err| LoadError::source_unavailable(name, err))
    }
}

impl BlobStore for LocalDirStore {
    fn container(&self) -> &str {
        &self.label
    }

    fn upload(&self, name: &str, data: &[u8]) -> LoadResult<()> {
        let path = self.path_for(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| LoadError::source_unavailable(name, err))?;
        }
        fs::write(&path, data).map_err(|err| LoadError::source_unavailable(name, err))?;
        info!("Uploaded {} byte(s) to {path:?}", data.len());
        Ok(())
    }

    fn list(&self) -> LoadResult<Vec<String>> {
        let mut names = Vec::new();
        collect_files(&self.root, &self.root, &mut names)
            .map_err(|err| LoadError::source_unavailable(&self.label, err))?;
        names.sort();
        Ok(names)
    }
}

fn collect_files(root: &Path, dir: &Path, names: &mut Vec<String>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(root, &path, names)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            let name = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            names.push(name);
        }
    }
    Ok(())
}

#[derive(Clone, PartialEq, Eq)]
enum Credential {
    SharedKey(Vec<u8>),
    Sas(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::SharedKey(_) => f.write_str("SharedKey(..)"),
            Credential::Sas(_) => f.write_str("Sas(..)"),
        }
    }
}

/// Storage account settings parsed from an Azure connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageAccount {
    pub name: String,
    pub blob_endpoint: Url,
    credential: Credential,
}

impl StorageAccount {
    pub fn from_connection_string(value: &str) -> LoadResult<Self> {
        let invalid = |detail: &str| LoadError::InvalidConfig(format!("storage connection string: {detail}"));
        let mut fields = BTreeMap::new();
        for part in value.split(';').map(str::trim).filter(|part| !part.is_empty()) {
            let (key, field) = part
                .split_once('=')
                .ok_or_else(|| invalid(&format!("'{part}' is not a key=value pair")))?;
            fields.insert(key.trim().to_ascii_lowercase(), field.trim().to_string());
        }

        if fields
            .get("usedevelopmentstorage")
            .is_some_and(|flag| flag.eq_ignore_ascii_case("true"))
        {
            let endpoint = fields
                .get("developmentstorageproxyuri")
                .map(|proxy| format!("{}/{DEV_ACCOUNT}", proxy.trim_end_matches('/')))
                .unwrap_or_else(|| DEV_BLOB_ENDPOINT.to_string());
            return Ok(Self {
                name: DEV_ACCOUNT.to_string(),
                blob_endpoint: Url::parse(&endpoint).map_err(|err| invalid(&err.to_string()))?,
                credential: Credential::SharedKey(
                    STANDARD
                        .decode(DEV_ACCOUNT_KEY)
                        .map_err(|err| invalid(&err.to_string()))?,
                ),
            });
        }

        let name = fields
            .get("accountname")
            .cloned()
            .ok_or_else(|| invalid("AccountName is missing"))?;
        let endpoint = match fields.get("blobendpoint") {
            Some(endpoint) => endpoint.clone(),
            None => {
                let protocol = fields
                    .get("defaultendpointsprotocol")
                    .map(String::as_str)
                    .unwrap_or("https");
                let suffix = fields
                    .get("endpointsuffix")
                    .map(String::as_str)
                    .unwrap_or("core.windows.net");
                format!("{protocol}://{name}.blob.{suffix}")
            }
        };
        let blob_endpoint = Url::parse(&endpoint).map_err(|err| invalid(&err.to_string()))?;
        let credential = if let Some(key) = fields.get("accountkey") {
            Credential::SharedKey(
                STANDARD
                    .decode(key)
                    .map_err(|err| invalid(&format!("AccountKey is not base64: {err}")))?,
            )
        } else if let Some(sas) = fields.get("sharedaccesssignature") {
            Credential::Sas(sas.trim_start_matches('?').to_string())
        } else {
            return Err(invalid("either AccountKey or SharedAccessSignature is required"));
        };

        Ok(Self {
            name,
            blob_endpoint,
            credential,
        })
    }

    fn sign(&self, key: &[u8], string_to_sign: &str) -> LoadResult<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(key)
            .map_err(|err| LoadError::InvalidConfig(format!("account key: {err}")))?;
        mac.update(string_to_sign.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());
        Ok(format!("SharedKey {}:{signature}", self.name))
    }
}

/// The text a SharedKey request signature is computed over.
pub(crate) fn string_to_sign(
    method: &Method,
    content_length: usize,
    content_type: &str,
    ms_headers: &[(&str, String)],
    account: &str,
    url: &Url,
) -> String {
    let length = if content_length == 0 {
        String::new()
    } else {
        content_length.to_string()
    };
    let mut headers = ms_headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.trim()))
        .collect::<Vec<_>>();
    headers.sort();
    let canonical_headers = headers
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect::<String>();

    let mut resource = format!("/{account}{}", url.path());
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in url.query_pairs() {
        params
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into_owned());
    }
    for (name, mut values) in params {
        values.sort();
        resource.push_str(&format!("\n{name}:{}", values.join(",")));
    }

    format!("{method}\n\n\n{length}\n\n{content_type}\n\n\n\n\n\n\n{canonical_headers}{resource}")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EnumerationResults {
    #[serde(default)]
    blobs: BlobList,
    #[serde(default)]
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BlobList {
    #[serde(rename = "Blob", default)]
    items: Vec<BlobItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlobItem {
    name: String,
}

/// One listing page: blob names and the continuation marker, if any.
pub(crate) fn parse_listing(xml: &str) -> LoadResult<(Vec<String>, Option<String>)> {
    let results: EnumerationResults = quick_xml::de::from_str(xml.trim_start_matches('\u{feff}'))
        .map_err(|err| LoadError::source_unavailable("blob listing", err))?;
    let marker = results.next_marker.filter(|marker| !marker.trim().is_empty());
    Ok((
        results.blobs.items.into_iter().map(|blob| blob.name).collect(),
        marker,
    ))
}

/// A single container in an Azure storage account.
pub struct AzureBlobStore {
    account: StorageAccount,
    container: String,
    client: Client,
}

impl AzureBlobStore {
    pub fn from_connection_string(connection_string: &str, container: &str) -> LoadResult<Self> {
        let account = StorageAccount::from_connection_string(connection_string)?;
        Self::new(account, container)
    }

    pub fn new(account: StorageAccount, container: &str) -> LoadResult<Self> {
        if container.is_empty() {
            return Err(LoadError::InvalidConfig("container name is empty".to_string()));
        }
        // Large extracts take longer than any fixed request timeout.
        let client = Client::builder()
            .timeout(None::<Duration>)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| LoadError::InvalidConfig(format!("building HTTP client: {err}")))?;
        Ok(Self {
            account,
            container: container.to_string(),
            client,
        })
    }

    fn url_for(&self, blob: Option<&str>) -> Result<Url, String> {
        let mut url = self.account.blob_endpoint.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| format!("'{}' cannot hold a path", self.account.blob_endpoint))?;
            segments.pop_if_empty().push(&self.container);
            if let Some(blob) = blob {
                segments.extend(blob.split('/'));
            }
        }
        Ok(url)
    }

    fn send(&self, method: Method, mut url: Url, body: Option<&[u8]>) -> Result<Response, String> {
        let mut ms_headers = vec![
            ("x-ms-date", Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()),
            ("x-ms-version", API_VERSION.to_string()),
        ];
        if body.is_some() {
            ms_headers.push(("x-ms-blob-type", "BlockBlob".to_string()));
        }
        let content_type = if body.is_some() { UPLOAD_CONTENT_TYPE } else { "" };
        let content_length = body.map_or(0, <[u8]>::len);

        let authorization = match &self.account.credential {
            Credential::SharedKey(key) => {
                let text = string_to_sign(
                    &method,
                    content_length,
                    content_type,
                    &ms_headers,
                    &self.account.name,
                    &url,
                );
                Some(self.account.sign(key, &text).map_err(|err| err.to_string())?)
            }
            Credential::Sas(token) => {
                let query = match url.query() {
                    Some(existing) => format!("{existing}&{token}"),
                    None => token.clone(),
                };
                url.set_query(Some(&query));
                None
            }
        };

        debug!("{method} {}", url.path());
        let mut request = self.client.request(method, url);
        for (name, value) in &ms_headers {
            request = request.header(*name, value);
        }
        if let Some(authorization) = authorization {
            request = request.header(AUTHORIZATION, authorization);
        }
        if let Some(body) = body {
            request = request.header(CONTENT_TYPE, content_type).body(body.to_vec());
        }
        let response = request.send().map_err(|err| err.to_string())?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let detail = response.text().unwrap_or_default();
            Err(format!("HTTP {status}: {}", detail.trim()))
        }
    }
}

impl ByteSource for AzureBlobStore {
    fn fetch(&self, name: &str) -> LoadResult<Vec<u8>> {
        let unavailable = |reason: String| LoadError::source_unavailable(name, reason);
        let url = self.url_for(Some(name)).map_err(unavailable)?;
        let mut response = self.send(Method::GET, url, None).map_err(unavailable)?;
        let mut buffer = Vec::with_capacity(response.content_length().unwrap_or(0) as usize);
        response
            .copy_to(&mut buffer)
            .map_err(|err| unavailable(err.to_string()))?;
        info!(
            "Downloaded {} byte(s) from '{}/{name}'",
            buffer.len(),
            self.container
        );
        Ok(buffer)
    }
}

impl BlobStore for AzureBlobStore {
    fn container(&self) -> &str {
        &self.container
    }

    fn upload(&self, name: &str, data: &[u8]) -> LoadResult<()> {
        let unavailable = |reason: String| LoadError::source_unavailable(name, reason);
        let url = self.url_for(Some(name)).map_err(unavailable)?;
        self.send(Method::PUT, url, Some(data)).map_err(unavailable)?;
        info!(
            "Uploaded {} byte(s) to '{}/{name}'",
            data.len(),
            self.container
        );
        Ok(())
    }

    fn list(&self) -> LoadResult<Vec<String>> {
        let unavailable = |reason: String| LoadError::source_unavailable(&self.container, reason);
        let mut names = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let mut url = self.url_for(None).map_err(unavailable)?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("restype", "container").append_pair("comp", "list");
                if let Some(marker) = &marker {
                    query.append_pair("marker", marker);
                }
            }
            let body = self
                .send(Method::GET, url, None)
                .and_then(|response| response.text().map_err(|err| err.to_string()))
                .map_err(unavailable)?;
            let (page, next) = parse_listing(&body)?;
            names.extend(page);
            match next {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        Ok(names)
    }
}
