//! Cross-instance session lease.
//!
//! A small filesystem token names the connector instance that currently
//! holds the authoritative role, surviving host-process in-memory
//! resets. The token is best-effort by design: a filesystem hiccup must
//! degrade to "assume authoritative", never to a dead bridge.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::BridgeConfig;

const TOKEN_FILE: &str = "patchbay-session.token";

/// Claim/own/release semantics over the session token. Abstracted so
/// tests can use an in-memory fake instead of real temp files.
pub trait SessionLease: Send + Sync {
    /// Take the token if it is absent or already names `id`. Returns
    /// true when `id` holds the lease after the call.
    fn claim(&self, id: &str) -> bool;

    /// Read-only check; does not claim.
    fn is_owner(&self, id: &str) -> bool;

    /// Delete the token if `id` owns it. Idempotent.
    fn release(&self, id: &str);
}

/// Filesystem-backed lease under a configurable directory.
pub struct FsSessionLease {
    path: PathBuf,
}

impl FsSessionLease {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(TOKEN_FILE),
        }
    }

    /// Lease rooted at the configured token directory.
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(&config.token_dir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete a token left behind by a crashed host. Called at host
    /// startup, before any connector claims.
    pub fn clear_stale(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "Removed stale session token");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove stale session token");
            }
        }
    }

    fn read_token(&self) -> Result<Option<String>, io::Error> {
        match std::fs::read_to_string(&self.path) {
            Ok(s) => {
                let s = s.trim().to_string();
                if s.is_empty() { Ok(None) } else { Ok(Some(s)) }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    // Atomic overwrite: write a sibling temp file, then rename over.
    fn write_token(&self, id: &str) {
        let tmp = self.path.with_extension("tmp");
        let result = std::fs::write(&tmp, id).and_then(|()| std::fs::rename(&tmp, &self.path));
        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to write session token");
        }
    }
}

impl SessionLease for FsSessionLease {
    fn claim(&self, id: &str) -> bool {
        match self.read_token() {
            Ok(Some(owner)) if owner != id => false,
            Ok(Some(_)) => true,
            Ok(None) => {
                self.write_token(id);
                tracing::debug!(%id, path = %self.path.display(), "Claimed session token");
                true
            }
            Err(e) => {
                // Availability over strictness: a read failure must not
                // take the bridge down.
                tracing::warn!(error = %e, "Session token unreadable, assuming authoritative");
                true
            }
        }
    }

    fn is_owner(&self, id: &str) -> bool {
        match self.read_token() {
            Ok(Some(owner)) => owner == id,
            Ok(None) => false,
            Err(_) => true,
        }
    }

    fn release(&self, id: &str) {
        let owns = match self.read_token() {
            Ok(Some(owner)) => owner == id,
            Ok(None) => false,
            Err(_) => true,
        };
        if owns {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %e, "Failed to release session token");
                }
            }
        }
    }
}

/// In-memory lease for tests and single-process embeddings.
pub struct MemorySessionLease {
    slot: Mutex<Option<String>>,
}

impl MemorySessionLease {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl Default for MemorySessionLease {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLease for MemorySessionLease {
    fn claim(&self, id: &str) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        match slot.as_deref() {
            Some(owner) => owner == id,
            None => {
                *slot = Some(id.to_string());
                true
            }
        }
    }

    fn is_owner(&self, id: &str) -> bool {
        let slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        slot.as_deref() == Some(id)
    }

    fn release(&self, id: &str) {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        if slot.as_deref() == Some(id) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_lease_first_claimant_wins() {
        let dir = tempfile::tempdir().unwrap();
        let lease = FsSessionLease::new(dir.path());

        assert!(lease.claim("x"));
        assert!(lease.is_owner("x"));
        assert!(!lease.claim("y"));
        assert!(!lease.is_owner("y"));

        // Re-claim by the owner stays true.
        assert!(lease.claim("x"));
    }

    #[test]
    fn fs_lease_release_frees_the_token() {
        let dir = tempfile::tempdir().unwrap();
        let lease = FsSessionLease::new(dir.path());

        assert!(lease.claim("x"));
        lease.release("y");
        assert!(lease.is_owner("x"), "non-owner release must be a no-op");

        lease.release("x");
        assert!(!lease.is_owner("x"));
        assert!(lease.claim("y"));
    }

    #[test]
    fn fs_lease_clear_stale_removes_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let lease = FsSessionLease::new(dir.path());
        assert!(lease.claim("crashed-instance"));

        let fresh = FsSessionLease::new(dir.path());
        fresh.clear_stale();
        assert!(fresh.claim("new-instance"));
    }

    #[test]
    fn fs_lease_from_config_places_the_token_under_token_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig {
            token_dir: dir.path().to_path_buf(),
            ..BridgeConfig::default()
        };
        let lease = FsSessionLease::from_config(&config);
        assert!(lease.path().starts_with(dir.path()));

        assert!(lease.claim("x"));
        assert!(lease.path().exists());
    }

    #[test]
    fn fs_lease_release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let lease = FsSessionLease::new(dir.path());
        lease.claim("x");
        lease.release("x");
        lease.release("x");
        assert!(!lease.is_owner("x"));
    }

    #[test]
    fn memory_lease_mirrors_fs_semantics() {
        let lease = MemorySessionLease::new();
        assert!(lease.claim("a"));
        assert!(!lease.claim("b"));
        assert!(lease.is_owner("a"));

        lease.release("b");
        assert!(lease.is_owner("a"));
        lease.release("a");
        assert!(lease.claim("b"));
    }
}
