use crate::store::{ObjectMeta, ObjectStore};
use crate::{StoreErrorKind, TileError};
use aws_config::Region;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::{primitives::ByteStream, Client};
use std::sync::Arc;
use tokio::runtime::Runtime;

const GCS_ENDPOINT: &str = "https://storage.googleapis.com";

#[derive(Clone, Debug)]
pub struct S3StoreConfig {
    pub bucket: String,
    pub region: String,
    pub prefix: String,
    pub endpoint: Option<String>,
}

impl S3StoreConfig {
    /// `s3://bucket/prefix` or `gs://bucket/prefix`; `gs://` goes through the
    /// GCS interoperability endpoint unless `TILEMERGE_S3_ENDPOINT` overrides it.
    pub fn from_location(location: &str) -> Result<Self, TileError> {
        let (scheme, rest) = location
            .split_once("://")
            .ok_or_else(|| TileError::Config(format!("'{}' is not a bucket URL", location)))?;
        let (bucket, prefix) = match rest.split_once('/') {
            Some((b, p)) => (b.to_string(), p.trim_matches('/').to_string()),
            None => (rest.to_string(), String::new()),
        };
        if bucket.is_empty() {
            return Err(TileError::Config(format!("'{}' names no bucket", location)));
        }

        let endpoint = std::env::var("TILEMERGE_S3_ENDPOINT")
            .ok()
            .filter(|e| !e.is_empty())
            .or_else(|| (scheme == "gs").then(|| GCS_ENDPOINT.to_string()));
        let default_region = if scheme == "gs" { "auto" } else { "us-east-1" };
        let region = std::env::var("TILEMERGE_S3_REGION").unwrap_or_else(|_| default_region.to_string());

        Ok(Self {
            bucket,
            region,
            prefix,
            endpoint,
        })
    }
}

#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
    prefix: String,
    runtime: Arc<Runtime>,
}

/// Maps an S3 error code and HTTP status onto the retry classes.
fn classify_code(code: Option<&str>, status: Option<u16>) -> StoreErrorKind {
    match (code, status) {
        (Some("NoSuchKey" | "NotFound"), _) | (None, Some(404)) => StoreErrorKind::NotFound,
        (Some("SlowDown" | "InternalError" | "ServiceUnavailable" | "RequestTimeout"), _) => StoreErrorKind::Transient,
        (_, Some(status)) if status == 429 || status >= 500 => StoreErrorKind::Transient,
        _ => StoreErrorKind::Permanent,
    }
}

fn classify<E: ProvideErrorMetadata>(err: &SdkError<E>) -> StoreErrorKind {
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StoreErrorKind::Transient
        }
        SdkError::ServiceError(service) => classify_code(service.err().code(), Some(service.raw().status().as_u16())),
        _ => StoreErrorKind::Permanent,
    }
}

impl S3Store {
    pub fn new(config: S3StoreConfig) -> Result<Self, TileError> {
        let runtime = Runtime::new().map_err(|e| TileError::Other(format!("tokio runtime error: {}", e)))?;
        let region = Region::new(config.region.clone());
        let base_config = runtime.block_on(aws_config::from_env().region(region.clone()).load());

        let mut s3_builder = aws_sdk_s3::config::Builder::from(&base_config).region(region);
        if let Some(endpoint) = &config.endpoint {
            s3_builder = s3_builder.endpoint_url(endpoint);
            s3_builder = s3_builder.force_path_style(true);
        }

        let client = Client::from_conf(s3_builder.build());

        Ok(Self {
            client,
            bucket: config.bucket,
            prefix: config.prefix,
            runtime: Arc::new(runtime),
        })
    }

    fn prefixed(&self, key: &str) -> String {
        let clean = key.trim_start_matches('/');
        if self.prefix.is_empty() {
            clean.to_string()
        } else {
            format!("{}/{}", self.prefix.trim_end_matches('/'), clean)
        }
    }

    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            key
        } else if let Some(rest) = key.strip_prefix(&format!("{}/", self.prefix.trim_end_matches('/'))) {
            rest
        } else {
            key
        }
    }
}

impl ObjectStore for S3Store {
    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, TileError> {
        let mut token: Option<String> = None;
        let mut objects = Vec::new();
        let prefixed_prefix = self.prefixed(prefix);

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefixed_prefix.clone());

            if let Some(ref cont) = token {
                request = request.continuation_token(cont);
            }

            let resp = self
                .runtime
                .block_on(request.send())
                .map_err(|e| TileError::store(classify(&e), prefix, format!("list: {}", e)))?;

            for object in resp.contents() {
                if let Some(key) = object.key() {
                    objects.push(ObjectMeta {
                        key: self.strip_prefix(key).to_string(),
                        size: object.size().unwrap_or_default().max(0) as u64,
                    });
                }
            }

            if resp.is_truncated().unwrap_or(false) {
                token = resp.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }

        objects.sort();
        Ok(objects)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, TileError> {
        let prefixed = self.prefixed(key);
        let resp = self
            .runtime
            .block_on(self.client.get_object().bucket(&self.bucket).key(prefixed).send())
            .map_err(|e| TileError::store(classify(&e), key, format!("get: {}", e)))?;

        let data = self
            .runtime
            .block_on(resp.body.collect())
            .map_err(|e| TileError::store(StoreErrorKind::Transient, key, format!("read body: {}", e)))?
            .to_vec();
        Ok(data)
    }

    fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), TileError> {
        let prefixed = self.prefixed(key);
        let body = ByteStream::from(bytes);
        self.runtime
            .block_on(
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(prefixed)
                    .body(body)
                    .send(),
            )
            .map_err(|e| TileError::store(classify(&e), key, format!("put: {}", e)))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), TileError> {
        let prefixed = self.prefixed(key);
        self.runtime
            .block_on(
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(prefixed)
                    .send(),
            )
            .map_err(|e| TileError::store(classify(&e), key, format!("delete: {}", e)))?;
        Ok(())
    }
}
