use super::sigv4::{canonical_query, payload_hash, uri_encode, Signer, SigningRequest};
use super::BlobStore;
use crate::error::StoreError;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Method, Response, StatusCode, Url};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Connection settings for an S3 (or S3-compatible) service.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub access_key: String,
    pub secret_key: String,
    /// Region used for signing and the default endpoint (e.g. `"us-east-1"`).
    pub region: String,
    /// Custom endpoint such as `https://<account>.r2.cloudflarestorage.com`.
    ///
    /// When set, requests use path-style addressing (`endpoint/bucket/key`).
    /// Otherwise `https://<bucket>.s3.<region>.amazonaws.com` is used.
    pub endpoint: Option<String>,
    /// Skip TLS certificate verification.
    pub accept_invalid_certs: bool,
    /// Canned ACL sent as `x-amz-acl` with every upload.
    pub acl: Option<String>,
}

/// [`BlobStore`] backed by the S3 REST API.
pub struct S3Store {
    client: reqwest::Client,
    config: S3Config,
}

impl S3Store {
    pub fn new(config: S3Config) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, config })
    }

    /// URL for an object (or the bucket itself when `key` is empty).
    fn url(&self, bucket: &str, key: &str, query: &str) -> Result<Url, StoreError> {
        let encoded_key = uri_encode(key, true);
        let base = match &self.config.endpoint {
            Some(endpoint) => format!(
                "{}/{}/{}",
                endpoint.trim_end_matches('/'),
                uri_encode(bucket, false),
                encoded_key
            ),
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                bucket, self.config.region, encoded_key
            ),
        };
        let full = if query.is_empty() {
            base
        } else {
            format!("{}?{}", base, query)
        };
        Url::parse(&full).map_err(|e| StoreError::Status {
            status: 0,
            message: format!("invalid url {}: {}", full, e),
        })
    }

    /// Signs and sends a request.
    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Vec<u8>,
        acl: Option<&str>,
    ) -> Result<Response, StoreError> {
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(StoreError::Status {
                    status: 0,
                    message: format!("url without host: {}", url),
                })
            }
        };
        let amz_date = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let content_hash = payload_hash(&body);

        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), host);
        headers.insert("x-amz-content-sha256".to_string(), content_hash.clone());
        headers.insert("x-amz-date".to_string(), amz_date.clone());
        if let Some(acl) = acl {
            headers.insert("x-amz-acl".to_string(), acl.to_string());
        }

        let signer = Signer {
            access_key: &self.config.access_key,
            secret_key: &self.config.secret_key,
            region: &self.config.region,
        };
        let authorization = signer.authorization(
            &SigningRequest {
                method: method.as_str(),
                canonical_uri: url.path(),
                canonical_query: url.query().unwrap_or(""),
                headers: &headers,
                payload_hash: &content_hash,
            },
            &amz_date,
        );

        debug!("{} {}", method, url);
        let mut request = self
            .client
            .request(method, url)
            .header("authorization", authorization);
        for (name, value) in headers.iter().filter(|(name, _)| name.as_str() != "host") {
            request = request.header(name.as_str(), value.as_str());
        }
        Ok(request.body(body).send().await?)
    }
}

/// Turns a non-success response into a [`StoreError::Status`].
async fn status_error(response: Response) -> StoreError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    StoreError::Status { status, message }
}

/// Text content of every `<tag>...</tag>` element, XML entities decoded.
fn xml_values(xml: &str, tag: &str) -> Vec<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut values = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(&close) else {
            break;
        };
        values.push(xml_unescape(&after[..end]));
        rest = &after[end + close.len()..];
    }
    values
}

fn xml_unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[async_trait]
impl BlobStore for S3Store {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut params = vec![("list-type", "2"), ("prefix", prefix)];
            if let Some(token) = continuation.as_deref() {
                params.push(("continuation-token", token));
            }
            let url = self.url(bucket, "", &canonical_query(&params))?;
            let response = self.send(Method::GET, url, Vec::new(), None).await?;
            if !response.status().is_success() {
                return Err(status_error(response).await);
            }
            let xml = response.text().await?;

            keys.extend(xml_values(&xml, "Key"));
            let truncated = xml_values(&xml, "IsTruncated")
                .first()
                .is_some_and(|v| v == "true");
            continuation = xml_values(&xml, "NextContinuationToken").into_iter().next();
            if !truncated || continuation.is_none() {
                break;
            }
        }

        Ok(keys)
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let url = self.url(bucket, key, "")?;
        let response = self.send(Method::GET, url, Vec::new(), None).await?;
        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(StoreError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
            _ => return Err(status_error(response).await),
        }

        let content_length = response.content_length();
        let mut body = Vec::with_capacity(content_length.unwrap_or(0) as usize);
        let mut byte_stream = response.bytes_stream();
        while let Some(piece) = byte_stream.next().await {
            body.extend_from_slice(&piece?);
        }

        // A short body means the connection dropped mid-stream.
        if let Some(expected) = content_length {
            if body.len() as u64 != expected {
                return Err(StoreError::Transport(format!(
                    "truncated body for {}: expected {} bytes, got {}",
                    key,
                    expected,
                    body.len()
                )));
            }
        }
        Ok(body)
    }

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), StoreError> {
        let url = self.url(bucket, key, "")?;
        let response = self
            .send(Method::PUT, url, body, self.config.acl.as_deref())
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let url = self.url(bucket, key, "")?;
        let response = self.send(Method::DELETE, url, Vec::new(), None).await?;
        let status = response.status();
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            return Err(status_error(response).await);
        }
        Ok(())
    }
}
