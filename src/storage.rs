//! Storage URL resolution for run recordings.
//!
//! `gs://bucket/prefix` addresses an object store; `file://host/path`
//! addresses the local filesystem, where `host` is just the first path
//! component. Readers and writers are handed to the wire layer as boxed
//! async byte streams.

use std::sync::Arc;

use futures_util::TryStreamExt;
use object_store::buffered::{BufReader, BufWriter};
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use serde_derive::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};

use crate::error::{Error, Result};
use crate::wire;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunObject {
    pub name: String,
}

pub trait StorageRead: AsyncRead + AsyncSeek + Unpin + Send {}
impl<T: AsyncRead + AsyncSeek + Unpin + Send> StorageRead for T {}

pub trait StorageWrite: AsyncWrite + Unpin + Send {}
impl<T: AsyncWrite + Unpin + Send> StorageWrite for T {}

pub type Reader = wire::Reader<Box<dyn StorageRead>>;
pub type Writer = wire::Writer<Box<dyn StorageWrite>>;

fn split_url(url: &str) -> Result<(&str, &str, &str)> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| Error::BadUrl(url.to_string()))?;
    let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
    Ok((scheme, host, path.trim_start_matches('/')))
}

fn gcs_store(bucket: &str, credentials: &str) -> Result<Arc<dyn ObjectStore>> {
    let mut builder = GoogleCloudStorageBuilder::new().with_bucket_name(bucket);
    if !credentials.is_empty() {
        builder = builder.with_service_account_key(credentials);
    }
    Ok(Arc::new(builder.build()?))
}

/// List run recordings under a storage URL.
pub async fn list_runs(url: &str, credentials: &str) -> Result<Vec<RunObject>> {
    let (scheme, host, path) = split_url(url)?;
    match scheme {
        "gs" => {
            let store = gcs_store(host, credentials)?;
            let prefix = ObjectPath::from(path);
            let mut objects = store.list(Some(&prefix));
            let mut runs = Vec::new();
            while let Some(meta) = objects.try_next().await? {
                runs.push(RunObject {
                    name: meta.location.to_string(),
                });
            }
            Ok(runs)
        }
        "file" => {
            let dir = format!("{host}/{path}");
            let mut runs = Vec::new();
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(runs),
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(".proio") {
                    runs.push(RunObject { name });
                }
            }
            runs.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(runs)
        }
        _ => Err(Error::BadUrlScheme(url.to_string())),
    }
}

/// Open an event reader over a storage URL.
pub async fn get_reader(url: &str, credentials: &str) -> Result<Reader> {
    let (scheme, host, path) = split_url(url)?;
    let input: Box<dyn StorageRead> = match scheme {
        "gs" => {
            let store = gcs_store(host, credentials)?;
            let location = ObjectPath::from(path);
            let meta = store.head(&location).await?;
            Box::new(BufReader::new(store, &meta))
        }
        "file" => {
            let file = tokio::fs::File::open(format!("{host}/{path}")).await?;
            Box::new(tokio::io::BufReader::new(file))
        }
        _ => return Err(Error::BadUrlScheme(url.to_string())),
    };
    Ok(wire::Reader::new(input))
}

/// Create an event writer at a storage URL.
pub async fn get_writer(url: &str, credentials: &str) -> Result<Writer> {
    let (scheme, host, path) = split_url(url)?;
    let output: Box<dyn StorageWrite> = match scheme {
        "gs" => {
            let store = gcs_store(host, credentials)?;
            Box::new(BufWriter::new(store, ObjectPath::from(path)))
        }
        "file" => {
            let full = format!("{host}/{path}");
            if let Some(parent) = std::path::Path::new(&full).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            Box::new(tokio::fs::File::create(full).await?)
        }
        _ => return Err(Error::BadUrlScheme(url.to_string())),
    };
    Ok(wire::Writer::new(output))
}
