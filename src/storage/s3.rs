//! S3 compatible object store driver.
//!
//! Objects live under the repository path used as a key prefix. There are no
//! real directories: path operations are synthesized from key prefixes, and
//! the driver advertises no `path` feature so callers never rely on them.
//! Listing follows continuation tokens transparently; request level retries
//! and backoff are delegated to the SDK retry configuration.

use std::io::{Cursor, Read};

use anyhow::{format_err, Context, Error};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use regex::Regex;

use crate::error::{vault_err, ErrorClass};
use crate::io::RawWrite;
use crate::storage::{InfoLevel, StorageDriver, StorageFeature, StorageInfo, WriteOptions};
use crate::tools::runtime::block_on;

const MAX_KEYS_PER_DELETE: usize = 1000;

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3 compatible stores; implies path style uris.
    pub endpoint: Option<String>,
    /// Static credentials; when absent the SDK provider chain applies
    /// (environment, profile, IMDSv2 instance credentials).
    pub key: Option<String>,
    pub key_secret: Option<String>,
    pub token: Option<String>,
}

pub struct S3Driver {
    client: Client,
    bucket: String,
}

impl S3Driver {
    pub fn new(config: &S3Config) -> Result<Self, Error> {
        let sdk_config = block_on(
            aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(config.region.clone()))
                .load(),
        );

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint.clone()).force_path_style(true);
        }

        if let (Some(key), Some(secret)) = (&config.key, &config.key_secret) {
            builder = builder.credentials_provider(Credentials::new(
                key.clone(),
                secret.clone(),
                config.token.clone(),
                None,
                "pgvault",
            ));
        }

        Ok(S3Driver {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
        })
    }

    fn key(path: &str) -> String {
        path.trim_start_matches('/').to_string()
    }

    fn prefix_occupied(&self, prefix: &str) -> Result<bool, Error> {
        let response = block_on(
            self.client
                .list_objects_v2()
                .bucket(self.bucket.clone())
                .prefix(prefix.to_string())
                .max_keys(1)
                .send(),
        )
        .context("unable to list bucket")?;

        Ok(response.key_count().unwrap_or(0) > 0)
    }
}

impl StorageDriver for S3Driver {
    fn name(&self) -> &'static str {
        "s3"
    }

    fn features(&self) -> StorageFeature {
        StorageFeature::COMPRESS | StorageFeature::ENCRYPTED_AT_REST
    }

    fn info(&self, path: &str, _level: InfoLevel) -> Result<Option<StorageInfo>, Error> {
        let key = Self::key(path);
        let name = key.rsplit('/').next().unwrap_or("").to_string();

        let head = block_on(
            self.client
                .head_object()
                .bucket(self.bucket.clone())
                .key(key.clone())
                .send(),
        );

        match head {
            Ok(output) => {
                let mut info =
                    StorageInfo::file(name, output.content_length().unwrap_or(0) as u64);
                info.modification_time = output.last_modified().map(|t| t.secs());
                Ok(Some(info))
            }
            Err(SdkError::ServiceError(err)) if matches!(err.err(), HeadObjectError::NotFound(_)) => {
                // A key prefix with content reports as a path.
                if self.prefix_occupied(&format!("{}/", key))? {
                    Ok(Some(StorageInfo::path(name)))
                } else {
                    Ok(None)
                }
            }
            Err(err) => Err(format_err!("unable to get info for '{}' - {}", path, err)),
        }
    }

    fn list(
        &self,
        path: &str,
        expression: Option<&Regex>,
        _level: InfoLevel,
    ) -> Result<Vec<StorageInfo>, Error> {
        let mut prefix = Self::key(path);
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }

        let mut result = Vec::new();
        let mut continuation_token = None;

        loop {
            let response = block_on(
                self.client
                    .list_objects_v2()
                    .bucket(self.bucket.clone())
                    .prefix(prefix.clone())
                    .delimiter("/")
                    .set_continuation_token(continuation_token)
                    .send(),
            )
            .with_context(|| format!("unable to list '{}'", path))?;

            for object in response.contents() {
                let key = object.key().unwrap_or("");
                let name = key[prefix.len()..].to_string();
                if name.is_empty() {
                    continue;
                }
                if let Some(expression) = expression {
                    if !expression.is_match(&name) {
                        continue;
                    }
                }

                let mut info = StorageInfo::file(name, object.size().unwrap_or(0) as u64);
                info.modification_time = object.last_modified().map(|t| t.secs());
                result.push(info);
            }

            for common in response.common_prefixes() {
                if let Some(sub) = common.prefix() {
                    let name = sub[prefix.len()..].trim_end_matches('/').to_string();
                    if name.is_empty() {
                        continue;
                    }
                    if let Some(expression) = expression {
                        if !expression.is_match(&name) {
                            continue;
                        }
                    }
                    result.push(StorageInfo::path(name));
                }
            }

            continuation_token = match response.next_continuation_token() {
                Some(token) => Some(token.to_string()),
                None => break,
            };
        }

        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    fn new_read(
        &self,
        path: &str,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<Option<Box<dyn Read>>, Error> {
        let range = match (offset, limit) {
            (Some(offset), Some(limit)) => {
                Some(format!("bytes={}-{}", offset, offset + limit - 1))
            }
            (Some(offset), None) => Some(format!("bytes={}-", offset)),
            (None, Some(limit)) => Some(format!("bytes=0-{}", limit - 1)),
            (None, None) => None,
        };

        let get = block_on(
            self.client
                .get_object()
                .bucket(self.bucket.clone())
                .key(Self::key(path))
                .set_range(range)
                .send(),
        );

        let output = match get {
            Ok(output) => output,
            Err(SdkError::ServiceError(err)) if matches!(err.err(), GetObjectError::NoSuchKey(_)) => {
                return Ok(None)
            }
            Err(err) => return Err(format_err!("unable to read '{}' - {}", path, err)),
        };

        let data = block_on(output.body.collect())
            .with_context(|| format!("unable to read '{}'", path))?
            .into_bytes();

        Ok(Some(Box::new(Cursor::new(data.to_vec()))))
    }

    fn new_write(&self, path: &str, _options: &WriteOptions) -> Result<Box<dyn RawWrite>, Error> {
        Ok(Box::new(S3Write {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: Self::key(path),
            staged: Some(Vec::new()),
        }))
    }

    fn path_create(
        &self,
        _path: &str,
        _mode: Option<u32>,
        _error_on_exists: bool,
        _recurse: bool,
    ) -> Result<(), Error> {
        // Paths do not exist in a bucket.
        Ok(())
    }

    fn path_remove(&self, path: &str, _recurse: bool) -> Result<(), Error> {
        let mut prefix = Self::key(path);
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }

        let mut keys = Vec::new();
        let mut continuation_token = None;

        loop {
            let response = block_on(
                self.client
                    .list_objects_v2()
                    .bucket(self.bucket.clone())
                    .prefix(prefix.clone())
                    .set_continuation_token(continuation_token)
                    .send(),
            )
            .with_context(|| format!("unable to list '{}'", path))?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    keys.push(
                        ObjectIdentifier::builder()
                            .key(key.to_string())
                            .build()
                            .context("build object identifier")?,
                    );
                }
            }

            continuation_token = match response.next_continuation_token() {
                Some(token) => Some(token.to_string()),
                None => break,
            };
        }

        for chunk in keys.chunks(MAX_KEYS_PER_DELETE) {
            let response = block_on(
                self.client
                    .delete_objects()
                    .bucket(self.bucket.clone())
                    .delete(
                        Delete::builder()
                            .set_objects(Some(chunk.to_vec()))
                            .build()
                            .context("build delete request")?,
                    )
                    .send(),
            )
            .with_context(|| format!("unable to remove path '{}'", path))?;

            let errors = response.errors();
            if !errors.is_empty() {
                return Err(format_err!(
                    "failed to delete {} of {} objects under '{}'",
                    errors.len(),
                    chunk.len(),
                    path
                ));
            }
        }

        Ok(())
    }

    fn remove(&self, path: &str, error_on_missing: bool) -> Result<(), Error> {
        if error_on_missing && self.info(path, InfoLevel::Exists)?.is_none() {
            return Err(vault_err(
                ErrorClass::FileMissing,
                format!("unable to remove '{}' - file is missing", path),
            ));
        }

        block_on(
            self.client
                .delete_object()
                .bucket(self.bucket.clone())
                .key(Self::key(path))
                .send(),
        )
        .with_context(|| format!("unable to remove '{}'", path))?;

        Ok(())
    }

    fn move_file(&self, from: &str, to: &str) -> Result<(), Error> {
        // No server-side rename: copy then delete.
        block_on(
            self.client
                .copy_object()
                .bucket(self.bucket.clone())
                .copy_source(format!("{}/{}", self.bucket, Self::key(from)))
                .key(Self::key(to))
                .send(),
        )
        .with_context(|| format!("unable to copy '{}' to '{}'", from, to))?;

        self.remove(from, false)
    }
}

struct S3Write {
    client: Client,
    bucket: String,
    key: String,
    staged: Option<Vec<u8>>,
}

impl RawWrite for S3Write {
    fn write_chunk(&mut self, data: &[u8]) -> Result<(), Error> {
        match self.staged.as_mut() {
            Some(staged) => {
                staged.extend_from_slice(data);
                Ok(())
            }
            None => Err(vault_err(ErrorClass::Assert, "s3 write already closed")),
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| vault_err(ErrorClass::Assert, "s3 write already closed"))?;

        // The object only becomes visible when the upload completes, which
        // is the atomicity the repository requires.
        block_on(
            self.client
                .put_object()
                .bucket(self.bucket.clone())
                .key(self.key.clone())
                .body(ByteStream::from(staged))
                .send(),
        )
        .map_err(|err| {
            vault_err(
                ErrorClass::FileWrite,
                format!("unable to write '{}' - {}", self.key, err),
            )
        })?;

        Ok(())
    }
}
