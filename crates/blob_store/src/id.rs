//! Blob identifiers and the mapping from identifier to storage location.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{
    BlobError,
    BlobResult,
    attributes::{BLOB_NAME_HEADER, Headers, is_direct_path},
};

/// Root of the location tree holding direct-path blobs.
pub const DIRECT_PATH_ROOT: &str = "directpath";

const DIRECT_PATH_ID_PREFIX: &str = "path$";
const VOLUMES: u32 = 43;
const CHAPTERS: u32 = 47;

/// Opaque blob identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobId(String);

impl BlobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The identifier of the direct-path blob stored under `name`.
    pub fn direct_path(name: &str) -> Self {
        Self(format!("{}{}", DIRECT_PATH_ID_PREFIX, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The blob name when this is a direct-path identifier.
    pub fn direct_path_name(&self) -> Option<&str> {
        self.0.strip_prefix(DIRECT_PATH_ID_PREFIX)
    }

    /// Relative location of this blob's records, without extension.
    pub fn location(&self) -> String {
        match self.direct_path_name() {
            Some(name) => format!("{}/{}", DIRECT_PATH_ROOT, name),
            None => {
                let (volume, chapter) = volume_and_chapter(&self.0);
                format!("vol-{:02}/chap-{:02}/{}", volume, chapter, self.0)
            }
        }
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlobId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

fn volume_and_chapter(id: &str) -> (u32, u32) {
    let digest = Sha256::digest(id.as_bytes());
    let volume_seed = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    let chapter_seed = u32::from_be_bytes([digest[4], digest[5], digest[6], digest[7]]);
    (volume_seed % VOLUMES + 1, chapter_seed % CHAPTERS + 1)
}

/// Chooses the identifier of a new blob.
///
/// A caller-assigned id always wins. Otherwise direct-path headers derive the
/// id from the blob name and everything else gets a random id.
pub fn resolve_blob_id(headers: &Headers, assigned: Option<BlobId>) -> BlobResult<BlobId> {
    if let Some(id) = assigned {
        return Ok(id);
    }
    if !is_direct_path(headers) {
        return Ok(BlobId::generate());
    }
    let name = headers.get(BLOB_NAME_HEADER).ok_or_else(|| {
        BlobError::consistency(format!(
            "direct-path blob is missing the {} header",
            BLOB_NAME_HEADER
        ))
    })?;
    Ok(BlobId::direct_path(&normalize_direct_path_name(name)?))
}

/// Strips leading and trailing separators and rejects names escaping the tree.
pub fn normalize_direct_path_name(name: &str) -> BlobResult<String> {
    let trimmed = name.trim_matches('/');
    if trimmed.is_empty() || trimmed.split('/').any(|segment| segment == "..") {
        return Err(BlobError::consistency(format!(
            "invalid direct-path blob name '{}'",
            name
        )));
    }
    Ok(trimmed.to_string())
}

/// Recovers a blob id from an attributes record key under `content_prefix`.
pub fn blob_id_from_attributes_key(content_prefix: &str, key: &str) -> Option<BlobId> {
    let location = key
        .strip_prefix(content_prefix)?
        .strip_suffix(crate::attributes::ATTRIBUTES_SUFFIX)?;
    if let Some(name) = location
        .strip_prefix(DIRECT_PATH_ROOT)
        .and_then(|rest| rest.strip_prefix('/'))
    {
        return Some(BlobId::direct_path(name));
    }
    let mut segments = location.splitn(3, '/');
    let volume = segments.next()?;
    let chapter = segments.next()?;
    let id = segments.next()?;
    if id.is_empty() || !is_numbered(volume, "vol-") || !is_numbered(chapter, "chap-") {
        return None;
    }
    Some(BlobId::new(id))
}

fn is_numbered(segment: &str, prefix: &str) -> bool {
    segment
        .strip_prefix(prefix)
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::attributes::DIRECT_PATH_HEADER;

    #[test]
    fn test_generated_location_is_stable_and_in_range() {
        let id = BlobId::new("5d0b8a2e-7f1c-4d4e-9d6b-b1d5f6a8c9e0");
        let location = id.location();
        assert_eq!(location, id.location());
        let parts: Vec<&str> = location.split('/').collect();
        assert_eq!(parts.len(), 3);
        let volume: u32 = parts[0].strip_prefix("vol-").unwrap().parse().unwrap();
        let chapter: u32 = parts[1].strip_prefix("chap-").unwrap().parse().unwrap();
        assert!((1..=VOLUMES).contains(&volume));
        assert!((1..=CHAPTERS).contains(&chapter));
        assert_eq!(parts[0].len(), 6);
        assert_eq!(parts[2], id.as_str());
    }

    #[test]
    fn test_direct_path_location() {
        let id = BlobId::direct_path("foo/bar/myblob");
        assert_eq!(id.as_str(), "path$foo/bar/myblob");
        assert_eq!(id.location(), "directpath/foo/bar/myblob");
        assert_eq!(id.direct_path_name(), Some("foo/bar/myblob"));
    }

    #[test]
    fn test_resolve_prefers_assigned_id() {
        let headers = HashMap::new();
        let id = resolve_blob_id(&headers, Some(BlobId::new("fixed"))).unwrap();
        assert_eq!(id.as_str(), "fixed");
        assert_ne!(resolve_blob_id(&headers, None).unwrap().as_str(), "fixed");
    }

    #[test]
    fn test_resolve_direct_path_headers() {
        let mut headers = HashMap::new();
        headers.insert(DIRECT_PATH_HEADER.to_string(), "true".to_string());
        assert!(resolve_blob_id(&headers, None).is_err());

        headers.insert(BLOB_NAME_HEADER.to_string(), "/foo/bar/myblob".to_string());
        let id = resolve_blob_id(&headers, None).unwrap();
        assert_eq!(id, BlobId::direct_path("foo/bar/myblob"));

        headers.insert(BLOB_NAME_HEADER.to_string(), "foo/../../etc".to_string());
        assert!(resolve_blob_id(&headers, None).is_err());
    }

    #[test]
    fn test_blob_id_from_attributes_key() {
        let id = BlobId::generate();
        let key = format!("prefix/content/{}.properties", id.location());
        assert_eq!(
            blob_id_from_attributes_key("prefix/content/", &key),
            Some(id.clone())
        );
        let content = format!("prefix/content/{}.bytes", id.location());
        assert_eq!(blob_id_from_attributes_key("prefix/content/", &content), None);

        let direct = "prefix/content/directpath/foo/bar.properties";
        assert_eq!(
            blob_id_from_attributes_key("prefix/content/", direct),
            Some(BlobId::direct_path("foo/bar"))
        );
        assert_eq!(
            blob_id_from_attributes_key("prefix/content/", "prefix/metadata.properties"),
            None
        );
        assert_eq!(
            blob_id_from_attributes_key("prefix/content/", "prefix/content/vol-1x/chap-02/a.properties"),
            None
        );
    }

    #[test]
    fn test_assigned_id_with_separators_is_recovered() {
        let id = BlobId::new("a/b");
        let key = format!("content/{}.properties", id.location());
        assert!(key.ends_with("/a/b.properties"));
        assert_eq!(blob_id_from_attributes_key("content/", &key), Some(id));
    }
}
