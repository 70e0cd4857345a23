//! Warehouse object storage.
//!
//! The warehouse root is either a local directory or an `s3://bucket/prefix`
//! URL. Both resolve to an `Arc<dyn ObjectStore>` rooted at the warehouse, so
//! table and checkpoint paths are relative to it. `memory://` gives an
//! in-process store, handy for demos.

use std::path::PathBuf;
use std::sync::Arc;

use object_store::ObjectStore;
use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::prefix::PrefixStore;
use tracing::info;

use crate::error::{Error, Result};

/// Build the object store for a warehouse location.
///
/// S3 credentials and region come from the standard `AWS_*` environment
/// variables.
pub fn open_warehouse(location: &str) -> Result<Arc<dyn ObjectStore>> {
    let location = location.trim();

    if let Some(rest) = location.strip_prefix("s3://") {
        let (bucket, prefix) = split_bucket(rest)?;
        let store = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            // Snapshot and checkpoint commits are create-only puts
            .with_conditional_put(S3ConditionalPut::ETagMatch)
            .build()
            .map_err(|e| Error::Config(format!("S3: {e}")))?;
        info!("Warehouse: s3://{}/{}", bucket, prefix);
        return wrap_with_prefix(store, prefix);
    }

    if location == "memory://" {
        info!("Warehouse: in-memory");
        return Ok(Arc::new(InMemory::new()));
    }

    build_local(location)
}

fn split_bucket(rest: &str) -> Result<(&str, &str)> {
    let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return Err(Error::Config("S3 warehouse URL has no bucket".into()));
    }
    Ok((bucket, prefix))
}

fn build_local(location: &str) -> Result<Arc<dyn ObjectStore>> {
    if location.is_empty() {
        return Err(Error::Config("warehouse location is empty".into()));
    }

    // LocalFileSystem::new_with_prefix needs an absolute path that exists
    let path = PathBuf::from(location);
    std::fs::create_dir_all(&path)?;
    let absolute = path.canonicalize()?;

    info!("Warehouse: {}", absolute.display());
    let store = LocalFileSystem::new_with_prefix(absolute)?;
    Ok(Arc::new(store))
}

fn wrap_with_prefix<T: ObjectStore>(store: T, prefix: &str) -> Result<Arc<dyn ObjectStore>> {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        return Ok(Arc::new(store));
    }
    let prefix = ObjectPath::parse(prefix)
        .map_err(|e| Error::Config(format!("invalid warehouse prefix {prefix:?}: {e}")))?;
    Ok(Arc::new(PrefixStore::new(store, prefix)))
}
