//! Read-only, path-scoped view of an extracted package directory, mounted
//! into the guest at `/app` (§4.6 "Bootstrap").
//!
//! Guest code only ever sees paths under [`MOUNT_POINT`] — `require('./lib')`
//! resolves to `/app/lib.js`, `res.sendFile("/app/public/a.html")` is a
//! literal guest path (S3) — regardless of where the package happens to be
//! extracted on the host. Every guest path is translated to a host path,
//! canonicalized, and checked to still live under the mount root before any
//! bytes are read, so `../../etc/passwd`-style escapes fail regardless of
//! symlinks.
//!
//! The grounding codebase loads module source out of a database transaction
//! rather than a filesystem, so this module has no direct counterpart there;
//! it follows the general shape of a host loading untrusted modules from a
//! scoped root (reject traversal, resolve relative to a root) adapted to
//! `std::fs`.

use std::path::{Path, PathBuf};

use rt_errors::RuntimeError;

/// The fixed guest-visible mount point every package is exposed under.
pub const MOUNT_POINT: &str = "/app";

#[derive(Debug, Clone)]
pub struct Vfs {
    root: PathBuf,
}

impl Vfs {
    pub fn mount(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a guest-relative specifier (e.g. `./lib/helper.js` or
    /// `lib/helper`) against `caller_dir`, itself a guest path already under
    /// [`MOUNT_POINT`]. Returns the resolved guest path.
    pub fn resolve(&self, caller_dir: &Path, specifier: &str) -> Result<PathBuf, RuntimeError> {
        let joined = caller_dir.join(specifier);
        let host = self.guest_to_host(&joined)?;
        let canonical_host = self.canonicalize_within_root(&host)?;
        Ok(self.host_to_guest(&canonical_host))
    }

    fn guest_to_host(&self, guest_path: &Path) -> Result<PathBuf, RuntimeError> {
        let normalized = normalize_lexically(guest_path);
        let rel = normalized.strip_prefix(MOUNT_POINT).map_err(|_| {
            RuntimeError::internal(format!(
                "path {} is outside the {MOUNT_POINT} mount",
                normalized.display()
            ))
        })?;
        Ok(self.root.join(rel))
    }

    fn host_to_guest(&self, host_path: &Path) -> PathBuf {
        let rel = host_path.strip_prefix(&self.root).unwrap_or(host_path);
        Path::new(MOUNT_POINT).join(rel)
    }

    fn canonicalize_within_root(&self, host_path: &Path) -> Result<PathBuf, RuntimeError> {
        let root = self.root.canonicalize().map_err(|e| {
            RuntimeError::internal(format!("vfs root {} unreadable: {e}", self.root.display()))
        })?;
        // canonicalize() requires the path to exist; callers probing
        // candidate extensions rely on that to mean "try the next one".
        let canonical = host_path.canonicalize().map_err(|_| RuntimeError::ModuleNotFound {
            specifier: self.host_to_guest(host_path).display().to_string(),
            from: MOUNT_POINT.to_string(),
        })?;
        if !canonical.starts_with(&root) {
            return Err(RuntimeError::internal(format!(
                "path {} escapes vfs root {}",
                canonical.display(),
                root.display()
            )));
        }
        Ok(canonical)
    }

    /// Reads a file's bytes given a guest path, enforcing the read-only
    /// mount boundary.
    pub async fn read(&self, guest_path: &Path) -> Result<Vec<u8>, RuntimeError> {
        let host = self.guest_to_host(guest_path)?;
        let canonical = self.canonicalize_within_root(&host)?;
        tokio::fs::read(&canonical)
            .await
            .map_err(|e| RuntimeError::internal(format!("read {} failed: {e}", canonical.display())))
    }

    /// Blocking counterpart of [`Vfs::read`], used on the `require()` path:
    /// module resolution happens inside synchronous ops so guest CommonJS
    /// semantics stay synchronous, and package directories are local disk,
    /// so a blocking read never stalls on the network.
    pub fn read_sync(&self, guest_path: &Path) -> Result<Vec<u8>, RuntimeError> {
        let host = self.guest_to_host(guest_path)?;
        let canonical = self.canonicalize_within_root(&host)?;
        std::fs::read(&canonical)
            .map_err(|e| RuntimeError::internal(format!("read {} failed: {e}", canonical.display())))
    }

    pub fn exists(&self, guest_path: &Path) -> bool {
        self.guest_to_host(guest_path)
            .map(|host| self.canonicalize_within_root(&host).is_ok())
            .unwrap_or(false)
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            },
            Component::CurDir => {},
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn reads_file_inside_root() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.js"), b"hello").unwrap();
        let vfs = Vfs::mount(dir.path());
        let bytes = vfs.read(Path::new("/app/index.js")).await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn traversal_outside_root_is_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("app")).unwrap();
        std::fs::write(dir.path().join("secret.txt"), b"nope").unwrap();
        let vfs = Vfs::mount(dir.path().join("app"));
        let escape = Path::new("/app/../secret.txt");
        assert!(vfs.read(escape).await.is_err());
    }

    #[test]
    fn resolve_tries_relative_specifier() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("lib/helper.js"), b"x").unwrap();
        let vfs = Vfs::mount(dir.path());
        let resolved = vfs.resolve(Path::new("/app"), "./lib/helper.js").unwrap();
        assert_eq!(resolved, Path::new("/app/lib/helper.js"));
    }

    #[test]
    fn path_outside_mount_point_does_not_exist() {
        let dir = TempDir::new().unwrap();
        let vfs = Vfs::mount(dir.path());
        assert!(!vfs.exists(Path::new("/etc/passwd")));
    }
}
