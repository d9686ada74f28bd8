//! Azure blob storage driver.
//!
//! Same virtual tree model as S3: blob names carry the repository path, no
//! real directories exist, and listings page transparently. Authentication
//! is shared-key or SAS token.

use std::io::{Cursor, Read};

use anyhow::{format_err, Context, Error};
use azure_storage::StorageCredentials;
use azure_storage_blobs::prelude::*;
use futures::StreamExt;
use regex::Regex;

use crate::error::{vault_err, ErrorClass};
use crate::io::RawWrite;
use crate::storage::{InfoLevel, StorageDriver, StorageFeature, StorageInfo, WriteOptions};
use crate::tools::runtime::block_on;

#[derive(Debug, Clone)]
pub struct AzureConfig {
    pub account: String,
    pub container: String,
    /// Shared account key; exclusive with `sas_token`.
    pub key: Option<String>,
    pub sas_token: Option<String>,
}

pub struct AzureDriver {
    container: ContainerClient,
}

impl AzureDriver {
    pub fn new(config: &AzureConfig) -> Result<Self, Error> {
        let credentials = match (&config.key, &config.sas_token) {
            (Some(key), _) => StorageCredentials::access_key(config.account.clone(), key.clone()),
            (None, Some(token)) => StorageCredentials::sas_token(token.clone())
                .map_err(|err| format_err!("invalid sas token - {}", err))?,
            (None, None) => {
                return Err(vault_err(
                    ErrorClass::Option,
                    "azure repository requires a shared key or sas token",
                ))
            }
        };

        let service = BlobServiceClient::new(config.account.clone(), credentials);
        Ok(AzureDriver {
            container: service.container_client(config.container.clone()),
        })
    }

    fn key(path: &str) -> String {
        path.trim_start_matches('/').to_string()
    }

    fn list_prefix(
        &self,
        prefix: &str,
        delimited: bool,
    ) -> Result<(Vec<StorageInfo>, Vec<String>), Error> {
        let mut files = Vec::new();
        let mut paths = Vec::new();

        let builder = self.container.list_blobs().prefix(prefix.to_string());
        let builder = if delimited { builder.delimiter("/") } else { builder };
        let mut stream = builder.into_stream();

        while let Some(page) = block_on(stream.next()) {
            let page = page.with_context(|| format!("unable to list '{}'", prefix))?;

            for blob in page.blobs.blobs() {
                let name = blob.name[prefix.len()..].to_string();
                if name.is_empty() {
                    continue;
                }
                let mut info = StorageInfo::file(name, blob.properties.content_length);
                info.modification_time = Some(blob.properties.last_modified.unix_timestamp());
                files.push(info);
            }

            for sub in page.blobs.prefixes() {
                let name = sub.name[prefix.len()..].trim_end_matches('/').to_string();
                if !name.is_empty() {
                    paths.push(name);
                }
            }
        }

        Ok((files, paths))
    }
}

impl StorageDriver for AzureDriver {
    fn name(&self) -> &'static str {
        "azure"
    }

    fn features(&self) -> StorageFeature {
        StorageFeature::COMPRESS | StorageFeature::ENCRYPTED_AT_REST
    }

    fn info(&self, path: &str, _level: InfoLevel) -> Result<Option<StorageInfo>, Error> {
        let key = Self::key(path);
        let name = key.rsplit('/').next().unwrap_or("").to_string();
        let blob = self.container.blob_client(key.clone());

        match block_on(blob.get_properties().into_future()) {
            Ok(response) => {
                let mut info =
                    StorageInfo::file(name, response.blob.properties.content_length);
                info.modification_time =
                    Some(response.blob.properties.last_modified.unix_timestamp());
                Ok(Some(info))
            }
            Err(err) if is_not_found(&err) => {
                let (files, paths) = self.list_prefix(&format!("{}/", key), true)?;
                if files.is_empty() && paths.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(StorageInfo::path(name)))
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

        let (files, paths) = self.list_prefix(&prefix, true)?;

        let mut result: Vec<StorageInfo> = files
            .into_iter()
            .chain(paths.into_iter().map(StorageInfo::path))
            .filter(|info| match expression {
                Some(expression) => expression.is_match(&info.name),
                None => true,
            })
            .collect();

        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    fn new_read(
        &self,
        path: &str,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<Option<Box<dyn Read>>, Error> {
        let blob = self.container.blob_client(Self::key(path));

        let data = match block_on(blob.get_content()) {
            Ok(data) => data,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(format_err!("unable to read '{}' - {}", path, err)),
        };

        let start = offset.unwrap_or(0).min(data.len() as u64) as usize;
        let end = match limit {
            Some(limit) => (start + limit as usize).min(data.len()),
            None => data.len(),
        };

        Ok(Some(Box::new(Cursor::new(data[start..end].to_vec()))))
    }

    fn new_write(&self, path: &str, _options: &WriteOptions) -> Result<Box<dyn RawWrite>, Error> {
        Ok(Box::new(AzureWrite {
            blob: self.container.blob_client(Self::key(path)),
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
        Ok(())
    }

    fn path_remove(&self, path: &str, _recurse: bool) -> Result<(), Error> {
        let mut prefix = Self::key(path);
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }

        let (files, _) = self.list_prefix(&prefix, false)?;
        for file in files {
            let blob = self.container.blob_client(format!("{}{}", prefix, file.name));
            block_on(blob.delete().into_future())
                .with_context(|| format!("unable to remove '{}{}'", prefix, file.name))?;
        }
        Ok(())
    }

    fn remove(&self, path: &str, error_on_missing: bool) -> Result<(), Error> {
        let blob = self.container.blob_client(Self::key(path));

        match block_on(blob.delete().into_future()) {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => {
                if error_on_missing {
                    Err(vault_err(
                        ErrorClass::FileMissing,
                        format!("unable to remove '{}' - file is missing", path),
                    ))
                } else {
                    Ok(())
                }
            }
            Err(err) => Err(format_err!("unable to remove '{}' - {}", path, err)),
        }
    }

    fn move_file(&self, from: &str, to: &str) -> Result<(), Error> {
        let data = match self.new_read(from, None, None)? {
            Some(mut read) => {
                let mut data = Vec::new();
                read.read_to_end(&mut data)?;
                data
            }
            None => {
                return Err(vault_err(
                    ErrorClass::FileMissing,
                    format!("unable to move '{}' - file is missing", from),
                ))
            }
        };

        let blob = self.container.blob_client(Self::key(to));
        block_on(blob.put_block_blob(data).into_future())
            .with_context(|| format!("unable to write '{}'", to))?;

        self.remove(from, false)
    }
}

fn is_not_found(err: &azure_core::Error) -> bool {
    matches!(
        err.kind(),
        azure_core::error::ErrorKind::HttpResponse {
            status: azure_core::StatusCode::NotFound,
            ..
        }
    )
}

struct AzureWrite {
    blob: BlobClient,
    staged: Option<Vec<u8>>,
}

impl RawWrite for AzureWrite {
    fn write_chunk(&mut self, data: &[u8]) -> Result<(), Error> {
        match self.staged.as_mut() {
            Some(staged) => {
                staged.extend_from_slice(data);
                Ok(())
            }
            None => Err(vault_err(ErrorClass::Assert, "azure write already closed")),
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| vault_err(ErrorClass::Assert, "azure write already closed"))?;

        block_on(self.blob.put_block_blob(staged).into_future()).map_err(|err| {
            vault_err(
                ErrorClass::FileWrite,
                format!("unable to write blob - {}", err),
            )
        })?;

        Ok(())
    }
}
