use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::adapters::ImageBytes;

const HANDLE_PREFIX: &str = "blob:dasher/";

/// Transient, locally resolvable reference to an image held by an
/// [`ImageStore`]. Not durable: it stops resolving once revoked.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageHandle(String);

impl ImageHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn id(&self) -> &str {
        self.0.strip_prefix(HANDLE_PREFIX).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for ImageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
struct StoredImage {
    bytes: Arc<ImageBytes>,
    path: Option<PathBuf>,
}

/// Owns every image the controller has produced and not yet released.
///
/// With a spill directory each image is also mirrored to
/// `<dir>/<handle id>.<ext>` so a terminal user can open it; revoking removes
/// the file. Dropping the store revokes everything still held.
#[derive(Debug, Default)]
pub struct ImageStore {
    images: HashMap<ImageHandle, StoredImage>,
    spill_dir: Option<PathBuf>,
    counter: u64,
}

impl ImageStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_spill_dir(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(Self {
            images: HashMap::new(),
            spill_dir: Some(dir),
            counter: 0,
        })
    }

    pub fn insert(&mut self, image: ImageBytes) -> Result<ImageHandle> {
        self.counter += 1;
        let handle = ImageHandle(format!(
            "{HANDLE_PREFIX}{}",
            short_id(&image.bytes, self.counter)
        ));
        let path = match self.spill_dir.as_ref() {
            Some(dir) => {
                let path = dir.join(format!("{}.{}", handle.id(), image.extension()));
                fs::write(&path, &image.bytes)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                Some(path)
            }
            None => None,
        };
        self.images.insert(
            handle.clone(),
            StoredImage {
                bytes: Arc::new(image),
                path,
            },
        );
        Ok(handle)
    }

    pub fn get(&self, handle: &ImageHandle) -> Option<Arc<ImageBytes>> {
        self.images.get(handle).map(|stored| Arc::clone(&stored.bytes))
    }

    pub fn path(&self, handle: &ImageHandle) -> Option<&Path> {
        self.images
            .get(handle)
            .and_then(|stored| stored.path.as_deref())
    }

    pub fn contains(&self, handle: &ImageHandle) -> bool {
        self.images.contains_key(handle)
    }

    /// Looks up a live handle by its string form, as stored in history.
    pub fn resolve(&self, raw: &str) -> Option<ImageHandle> {
        self.images.keys().find(|handle| handle.as_str() == raw).cloned()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Releases one image. Returns false when the handle was not live.
    pub fn revoke(&mut self, handle: &ImageHandle) -> bool {
        let Some(stored) = self.images.remove(handle) else {
            return false;
        };
        if let Some(path) = stored.path {
            let _ = fs::remove_file(path);
        }
        true
    }

    pub fn revoke_all(&mut self) -> usize {
        let handles = self.images.keys().cloned().collect::<Vec<_>>();
        handles
            .iter()
            .filter(|handle| self.revoke(handle))
            .count()
    }

    /// Copies a live image to a durable location.
    pub fn persist(&self, handle: &ImageHandle, dir: &Path, stem: &str) -> Result<PathBuf> {
        let image = self
            .get(handle)
            .with_context(|| format!("image {handle} is no longer available"))?;
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(format!("{stem}.{}", image.extension()));
        fs::write(&path, &image.bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }
}

impl Drop for ImageStore {
    fn drop(&mut self) {
        self.revoke_all();
    }
}

fn short_id(bytes: &[u8], counter: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.update(counter.to_be_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}
