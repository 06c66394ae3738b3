//! S3-compatible object storage
//!
//! Objects are addressed path-style (`{endpoint}/{bucket}/{key}`) and every
//! request is signed with AWS Signature Version 4.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use mailcatch_common::config::S3Config;
use mailcatch_common::{Error, Result};
use reqwest::{Client, Method, StatusCode};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, info};

use crate::file::FileStorage;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";

/// Object storage client
pub struct ObjectStorage {
    client: Client,
    scheme: &'static str,
    host: String,
    bucket: String,
    region: String,
    access_key: String,
    secret_key: String,
    prefix: String,
    compress: bool,
}

impl std::fmt::Debug for ObjectStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStorage")
            .field("host", &self.host)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("prefix", &self.prefix)
            .field("compress", &self.compress)
            .finish_non_exhaustive()
    }
}

impl ObjectStorage {
    /// Create a new object storage client from config
    pub fn new(config: &S3Config) -> Result<Self> {
        let host = config
            .endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();

        if host.is_empty() || config.bucket.is_empty() {
            return Err(Error::Config(
                "Object storage requires endpoint and bucket".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Storage(format!("Failed to build HTTP client: {}", e)))?;

        info!(endpoint = %host, bucket = %config.bucket, "Initialized object storage");

        Ok(Self {
            client,
            scheme: if config.use_ssl { "https" } else { "http" },
            host,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
            prefix: config.path_prefix.trim_matches('/').to_string(),
            compress: config.compress,
        })
    }

    /// Object key including the configured prefix
    fn object_key(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if self.prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.prefix, path)
        }
    }

    fn canonical_uri(&self, key: &str) -> String {
        format!("/{}/{}", uri_encode(&self.bucket, true), uri_encode(key, false))
    }

    /// Build a signed request for `key`
    fn signed_request(
        &self,
        method: Method,
        key: &str,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<reqwest::RequestBuilder> {
        let uri = self.canonical_uri(key);
        let payload_hash = hex::encode(Sha256::digest(body));
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let authorization = self.authorization(method.as_str(), &uri, &payload_hash, now)?;

        Ok(self
            .client
            .request(method, format!("{}://{}{}", self.scheme, self.host, uri))
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", payload_hash)
            .header("authorization", authorization))
    }

    /// `Authorization` header value for a request
    fn authorization(
        &self,
        method: &str,
        canonical_uri: &str,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let scope = format!("{}/{}/s3/aws4_request", date, self.region);

        let canonical_request = format!(
            "{}\n{}\n\nhost:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n\n{}\n{}",
            method, canonical_uri, self.host, payload_hash, amz_date, SIGNED_HEADERS, payload_hash
        );

        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let key = signing_key(&self.secret_key, &date, &self.region, "s3")?;
        let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

        Ok(format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, self.access_key, scope, SIGNED_HEADERS, signature
        ))
    }
}

#[async_trait]
impl FileStorage for ObjectStorage {
    fn backend(&self) -> &'static str {
        "s3"
    }

    fn compresses(&self) -> bool {
        self.compress
    }

    async fn store(
        &self,
        path: &str,
        data: &[u8],
        content_type: &str,
        content_encoding: Option<&str>,
    ) -> Result<String> {
        let key = self.object_key(path);
        let mut request = self
            .signed_request(Method::PUT, &key, data, Utc::now())?
            .header("content-type", content_type)
            .body(data.to_vec());
        if let Some(encoding) = content_encoding {
            request = request.header("content-encoding", encoding);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Storage(format!("Object upload failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Storage(format!(
                "Object upload of {} returned status {}",
                key,
                response.status()
            )));
        }

        debug!(key = %key, size = data.len(), content_encoding = ?content_encoding, "Stored object");
        Ok(format!("s3://{}/{}", self.bucket, key))
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let key = self.object_key(path);
        let response = self
            .signed_request(Method::GET, &key, b"", Utc::now())?
            .send()
            .await
            .map_err(|e| Error::Storage(format!("Object download failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Storage(format!(
                "Object download of {} returned status {}",
                key,
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Storage(format!("Failed to read object body: {}", e)))?;
        Ok(bytes.to_vec())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let key = self.object_key(path);
        let response = self
            .signed_request(Method::HEAD, &key, b"", Utc::now())?
            .send()
            .await
            .map_err(|e| Error::Storage(format!("Object lookup failed: {}", e)))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(Error::Storage(format!(
                "Object lookup of {} returned status {}",
                key, status
            ))),
        }
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::Internal(format!("Invalid HMAC key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Derive the SigV4 signing key for a date/region/service scope
fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Result<Vec<u8>> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

/// Percent-encode per SigV4 rules; `/` is kept unless `encode_slash`
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
