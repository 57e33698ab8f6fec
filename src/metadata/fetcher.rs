//! Stateless request builder/decoder against the metadata store.
//!
//! No caching here: every call builds the backend request, issues it, and
//! decodes the response into typed metadata. Blob hashes are keyed by
//! decimal identifier; the name → id index is an ordered hash keyed by
//! locality hints, so one directory's entries are co-located in the
//! backend.
//!
//! Every decoded response is cross-checked against the request (identifier
//! echo, index/blob agreement); a backend that answers with somebody
//! else's metadata is reported as a fatal remote inconsistency, never
//! silently cached.
use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tracing::*;

use crate::error::{DecodeError, Error};
use crate::ids::{ContainerIdentifier, FileIdentifier, LocalityHint};
use crate::remote::{MetadataStore, RemoteStatus, StatusCode};

use super::types::{decode_blob, ContainerMetadata, FileMetadata};

/// Hash holding file metadata blobs, field = decimal file id.
const KEY_FILE_MD: &str = "md:file";
/// Hash holding container metadata blobs, field = decimal container id.
const KEY_CONTAINER_MD: &str = "md:container";
/// Ordered hash mapping locality hints to file ids.
const KEY_FILE_INDEX: &str = "md:index:files";
/// Ordered hash mapping locality hints to container ids.
const KEY_CONTAINER_INDEX: &str = "md:index:containers";

/// Concurrent in-flight requests of one batched directory fetch.
const BATCH_CONCURRENCY: usize = 16;

fn key_sub_files(container: ContainerIdentifier) -> String {
    format!("md:container:{}:files", container.underlying())
}

fn key_sub_containers(container: ContainerIdentifier) -> String {
    format!("md:container:{}:containers", container.underlying())
}

fn decimal(id: u64) -> Vec<u8> {
    id.to_string().into_bytes()
}

fn parse_decimal(raw: &[u8]) -> Result<u64, Error> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| DecodeError::Ascii.into())
}

fn parse_name(raw: &[u8]) -> Result<String, Error> {
    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::Utf8.into())
}

/// Entry names must be non-empty single path components.
fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("empty entry name"));
    }
    if name.contains('/') {
        return Err(Error::InvalidArgument("entry name contains a slash"));
    }
    if name.contains('\0') {
        return Err(Error::InvalidArgument("entry name contains NUL"));
    }
    if name == "." || name == ".." {
        return Err(Error::InvalidArgument("entry name is a dot entry"));
    }
    Ok(())
}

fn check_parent(parent: ContainerIdentifier) -> Result<(), Error> {
    if parent.is_absent() {
        return Err(Error::not_found(format!("{} (cid=0 is illegal)", parent)));
    }
    Ok(())
}

fn inconsistent(detail: String) -> Error {
    Error::FatalRemote(RemoteStatus::error(StatusCode::Error, detail))
}

pub struct MetadataFetcher;

impl MetadataFetcher {
    pub async fn get_file(
        store: &dyn MetadataStore,
        id: FileIdentifier,
    ) -> Result<FileMetadata, Error> {
        if id.is_absent() {
            return Err(Error::not_found(format!("{} (fid=0 is illegal)", id)));
        }
        let blob = store
            .hget(KEY_FILE_MD, &decimal(id.underlying()))
            .await?
            .ok_or_else(|| Error::not_found(id.to_string()))?;
        let md: FileMetadata = decode_blob(&blob)?;
        if md.id != id {
            return Err(inconsistent(format!(
                "backend returned {} for {}",
                md.id, id
            )));
        }
        Ok(md)
    }

    pub async fn get_container(
        store: &dyn MetadataStore,
        id: ContainerIdentifier,
    ) -> Result<ContainerMetadata, Error> {
        check_parent(id)?;
        let blob = store
            .hget(KEY_CONTAINER_MD, &decimal(id.underlying()))
            .await?
            .ok_or_else(|| Error::not_found(id.to_string()))?;
        let md: ContainerMetadata = decode_blob(&blob)?;
        if md.id != id {
            return Err(inconsistent(format!(
                "backend returned {} for {}",
                md.id, id
            )));
        }
        Ok(md)
    }

    pub async fn file_exists(
        store: &dyn MetadataStore,
        id: FileIdentifier,
    ) -> Result<bool, Error> {
        if id.is_absent() {
            return Ok(false);
        }
        Ok(store
            .hget(KEY_FILE_MD, &decimal(id.underlying()))
            .await?
            .is_some())
    }

    /// Batched existence probe, one answer per queried id, in input order.
    pub async fn files_exist(
        store: &Arc<dyn MetadataStore>,
        ids: &[FileIdentifier],
    ) -> Result<Vec<bool>, Error> {
        let results: Vec<Result<bool, Error>> = stream::iter(ids.iter().copied())
            .map(|id| {
                let store = store.clone();
                async move { Self::file_exists(store.as_ref(), id).await }
            })
            .buffered(BATCH_CONCURRENCY)
            .collect()
            .await;
        results.into_iter().collect()
    }

    /// `name -> file id` map of a container's direct children.
    pub async fn get_file_map(
        store: &dyn MetadataStore,
        container: ContainerIdentifier,
    ) -> Result<BTreeMap<String, FileIdentifier>, Error> {
        check_parent(container)?;
        let pairs = store.hgetall(&key_sub_files(container)).await?;
        pairs
            .into_iter()
            .map(|(name, id)| {
                let id = FileIdentifier::new(parse_decimal(&id)?);
                if id.is_absent() {
                    return Err(inconsistent(format!(
                        "file map of {} holds a zero id",
                        container
                    )));
                }
                Ok((parse_name(&name)?, id))
            })
            .collect()
    }

    /// `name -> container id` map of a container's direct sub-containers.
    pub async fn get_container_map(
        store: &dyn MetadataStore,
        container: ContainerIdentifier,
    ) -> Result<BTreeMap<String, ContainerIdentifier>, Error> {
        check_parent(container)?;
        let pairs = store.hgetall(&key_sub_containers(container)).await?;
        pairs
            .into_iter()
            .map(|(name, id)| {
                let id = ContainerIdentifier::new(parse_decimal(&id)?);
                if id.is_absent() {
                    return Err(inconsistent(format!(
                        "container map of {} holds a zero id",
                        container
                    )));
                }
                Ok((parse_name(&name)?, id))
            })
            .collect()
    }

    pub async fn count_files(
        store: &dyn MetadataStore,
        container: ContainerIdentifier,
    ) -> Result<u64, Error> {
        check_parent(container)?;
        store.hlen(&key_sub_files(container)).await
    }

    pub async fn count_containers(
        store: &dyn MetadataStore,
        container: ContainerIdentifier,
    ) -> Result<u64, Error> {
        check_parent(container)?;
        store.hlen(&key_sub_containers(container)).await
    }

    /// Resolve a file id from its parent and name through the locality
    /// index.
    pub async fn get_file_id_by_name(
        store: &dyn MetadataStore,
        parent: ContainerIdentifier,
        name: &str,
    ) -> Result<FileIdentifier, Error> {
        check_parent(parent)?;
        validate_name(name)?;
        let raw = store
            .hget(KEY_FILE_INDEX, &LocalityHint::build(parent, name))
            .await?
            .ok_or_else(|| Error::not_found(format!("{}/{}", parent, name)))?;
        let id = FileIdentifier::new(parse_decimal(&raw)?);
        if id.is_absent() {
            return Err(inconsistent(format!(
                "locality index of {}/{} holds a zero id",
                parent, name
            )));
        }
        Ok(id)
    }

    pub async fn get_container_id_by_name(
        store: &dyn MetadataStore,
        parent: ContainerIdentifier,
        name: &str,
    ) -> Result<ContainerIdentifier, Error> {
        check_parent(parent)?;
        validate_name(name)?;
        let raw = store
            .hget(KEY_CONTAINER_INDEX, &LocalityHint::build(parent, name))
            .await?
            .ok_or_else(|| Error::not_found(format!("{}/{}", parent, name)))?;
        let id = ContainerIdentifier::new(parse_decimal(&raw)?);
        if id.is_absent() {
            return Err(inconsistent(format!(
                "locality index of {}/{} holds a zero id",
                parent, name
            )));
        }
        Ok(id)
    }

    /// Two-step by-name retrieval: resolve the id through the locality
    /// index, fetch the blob, and verify the index and the blob agree. A
    /// dangling index entry surfaces as *not-found* with the index
    /// coordinates; a blob claiming another parent or name is a fatal
    /// backend inconsistency.
    pub async fn get_file_by_name(
        store: &dyn MetadataStore,
        parent: ContainerIdentifier,
        name: &str,
    ) -> Result<FileMetadata, Error> {
        let id = Self::get_file_id_by_name(store, parent, name).await?;
        let md = match Self::get_file(store, id).await {
            Ok(md) => md,
            Err(e) if matches!(e, Error::NotFound(_)) => {
                warn!(%parent, name, %id, "locality index points at a missing blob");
                return Err(Error::not_found(format!(
                    "{}/{} (dangling index entry for {})",
                    parent, name, id
                )));
            }
            Err(e) => return Err(e),
        };
        if md.container != parent || md.name != name {
            return Err(inconsistent(format!(
                "locality index out of sync: {}/{} resolved to {} ({}/{})",
                parent, name, md.id, md.container, md.name
            )));
        }
        Ok(md)
    }

    pub async fn get_container_by_name(
        store: &dyn MetadataStore,
        parent: ContainerIdentifier,
        name: &str,
    ) -> Result<ContainerMetadata, Error> {
        let id = Self::get_container_id_by_name(store, parent, name).await?;
        let md = match Self::get_container(store, id).await {
            Ok(md) => md,
            Err(e) if matches!(e, Error::NotFound(_)) => {
                warn!(%parent, name, %id, "locality index points at a missing blob");
                return Err(Error::not_found(format!(
                    "{}/{} (dangling index entry for {})",
                    parent, name, id
                )));
            }
            Err(e) => return Err(e),
        };
        if md.parent != parent || md.name != name {
            return Err(inconsistent(format!(
                "locality index out of sync: {}/{} resolved to {} ({}/{})",
                parent, name, md.id, md.parent, md.name
            )));
        }
        Ok(md)
    }

    /// One future per child file of the container, ordered by name; used to
    /// prefetch a whole directory.
    pub async fn get_files_in_container(
        store: &Arc<dyn MetadataStore>,
        container: ContainerIdentifier,
    ) -> Result<Vec<(String, BoxFuture<'static, Result<FileMetadata, Error>>)>, Error> {
        let map = Self::get_file_map(store.as_ref(), container).await?;
        Ok(map
            .into_iter()
            .map(|(name, id)| {
                let store = store.clone();
                let fut = async move { Self::get_file(store.as_ref(), id).await }.boxed();
                (name, fut)
            })
            .collect())
    }

    /// One future per child container, ordered by name.
    pub async fn get_containers_in_container(
        store: &Arc<dyn MetadataStore>,
        container: ContainerIdentifier,
    ) -> Result<Vec<(String, BoxFuture<'static, Result<ContainerMetadata, Error>>)>, Error> {
        let map = Self::get_container_map(store.as_ref(), container).await?;
        Ok(map
            .into_iter()
            .map(|(name, id)| {
                let store = store.clone();
                let fut = async move { Self::get_container(store.as_ref(), id).await }.boxed();
                (name, fut)
            })
            .collect())
    }

    /// Resolve a whole directory of file metadata in one sweep: list the
    /// children, fan the blob fetches out with bounded concurrency, and
    /// collect per-child outcomes in name order. A missing or corrupt
    /// child does not abort its siblings; its slot carries the error.
    pub async fn fetch_files_in_container(
        store: &Arc<dyn MetadataStore>,
        container: ContainerIdentifier,
    ) -> Result<Vec<(String, Result<FileMetadata, Error>)>, Error> {
        let map = Self::get_file_map(store.as_ref(), container).await?;
        debug!(%container, children = map.len(), "batch-fetching directory files");
        let out = stream::iter(map.into_iter())
            .map(|(name, id)| {
                let store = store.clone();
                async move {
                    let result = Self::get_file(store.as_ref(), id).await;
                    (name, result)
                }
            })
            .buffered(BATCH_CONCURRENCY)
            .collect()
            .await;
        Ok(out)
    }

    /// Batched sub-container resolution, bounded like
    /// [`Self::fetch_files_in_container`].
    pub async fn fetch_containers_in_container(
        store: &Arc<dyn MetadataStore>,
        container: ContainerIdentifier,
    ) -> Result<Vec<(String, Result<ContainerMetadata, Error>)>, Error> {
        let map = Self::get_container_map(store.as_ref(), container).await?;
        debug!(%container, children = map.len(), "batch-fetching sub-containers");
        let out = stream::iter(map.into_iter())
            .map(|(name, id)| {
                let store = store.clone();
                async move {
                    let result = Self::get_container(store.as_ref(), id).await;
                    (name, result)
                }
            })
            .buffered(BATCH_CONCURRENCY)
            .collect()
            .await;
        Ok(out)
    }
}

/// Backend key/field layout helpers, exposed so the owning service and the
/// tests populate the store consistently.
pub mod keys {
    use super::*;

    pub fn file_md() -> &'static str {
        KEY_FILE_MD
    }
    pub fn container_md() -> &'static str {
        KEY_CONTAINER_MD
    }
    pub fn file_index() -> &'static str {
        KEY_FILE_INDEX
    }
    pub fn container_index() -> &'static str {
        KEY_CONTAINER_INDEX
    }
    pub fn sub_files(container: ContainerIdentifier) -> String {
        key_sub_files(container)
    }
    pub fn sub_containers(container: ContainerIdentifier) -> String {
        key_sub_containers(container)
    }
    pub fn id_field(id: u64) -> Vec<u8> {
        decimal(id)
    }
    pub fn name_field(parent: ContainerIdentifier, name: &str) -> Vec<u8> {
        LocalityHint::build(parent, name)
    }
}
