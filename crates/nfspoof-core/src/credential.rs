//! Spoofed identity state
//!
//! The credential stamped into every outgoing call is owned by a
//! [`CredentialManager`] that callers hold explicitly (usually behind an
//! `Arc`) and pass to the protocol client. Readers take a snapshot per call,
//! so a change made by [`CredentialManager::set_identity`] applies to calls
//! issued after it returns while calls already in flight keep the snapshot
//! they were stamped with.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::rpc::MAX_AUTH_UNIX_GIDS;
use crate::types::Attributes;

/// AUTH_UNIX allows at most 16 supplementary groups
pub const DEFAULT_MAX_AUX_GIDS: usize = 16;

/// Identity presented in the AUTH_UNIX credential
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Credential {
    pub uid: u32,
    pub gid: u32,
    pub supplementary_gids: Vec<u32>,
}

impl Credential {
    pub fn new(uid: u32, gid: u32, supplementary_gids: Vec<u32>) -> Self {
        Self {
            uid,
            gid,
            supplementary_gids,
        }
    }

    /// uid 0 / gid 0, the identity used until the operator sets one
    pub fn root() -> Self {
        Self::default()
    }
}

/// Outcome of an identity change
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityUpdate {
    /// The credential now in effect
    pub credential: Credential,
    /// Supplementary gids cut off by the protocol limit
    pub dropped_gids: Vec<u32>,
}

impl IdentityUpdate {
    pub fn is_truncated(&self) -> bool {
        !self.dropped_gids.is_empty()
    }
}

/// Holds the active spoofed identity
pub struct CredentialManager {
    current: RwLock<Arc<Credential>>,
    max_aux_gids: usize,
    impersonate_owner: AtomicBool,
}

impl CredentialManager {
    /// `max_aux_gids` is capped at what AUTH_UNIX can carry
    pub fn new(max_aux_gids: usize) -> Self {
        if max_aux_gids > MAX_AUTH_UNIX_GIDS {
            warn!(
                "max_aux_gids {} exceeds the AUTH_UNIX limit, using {}",
                max_aux_gids, MAX_AUTH_UNIX_GIDS
            );
        }
        let max_aux_gids = max_aux_gids.min(MAX_AUTH_UNIX_GIDS);
        Self {
            current: RwLock::new(Arc::new(Credential::root())),
            max_aux_gids,
            impersonate_owner: AtomicBool::new(false),
        }
    }

    /// Start with `credential` instead of root (truncated like [`Self::set_identity`])
    pub fn with_identity(credential: Credential, max_aux_gids: usize) -> Self {
        let manager = Self::new(max_aux_gids);
        manager.set_identity(
            credential.uid,
            credential.gid,
            credential.supplementary_gids,
        );
        manager
    }

    pub fn max_aux_gids(&self) -> usize {
        self.max_aux_gids
    }

    /// Replace the active identity
    pub fn set_identity(&self, uid: u32, gid: u32, mut supplementary_gids: Vec<u32>) -> IdentityUpdate {
        let dropped_gids = if supplementary_gids.len() > self.max_aux_gids {
            supplementary_gids.split_off(self.max_aux_gids)
        } else {
            Vec::new()
        };
        if !dropped_gids.is_empty() {
            warn!(
                "identity has {} supplementary gids, limit is {}; dropped {:?}",
                self.max_aux_gids + dropped_gids.len(),
                self.max_aux_gids,
                dropped_gids
            );
        }

        let credential = Credential::new(uid, gid, supplementary_gids);
        *self.current.write() = Arc::new(credential.clone());
        info!(
            "identity set to uid={} gid={} gids={:?}",
            credential.uid, credential.gid, credential.supplementary_gids
        );

        IdentityUpdate {
            credential,
            dropped_gids,
        }
    }

    /// Snapshot of the active identity
    pub fn current(&self) -> Credential {
        Credential::clone(&self.current.read())
    }

    pub fn set_impersonate_owner(&self, enabled: bool) {
        self.impersonate_owner.store(enabled, Ordering::Release);
        info!("owner impersonation {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn impersonates_owner(&self) -> bool {
        self.impersonate_owner.load(Ordering::Acquire)
    }

    /// Credential to present for an operation on an object owned per `owner`
    ///
    /// With owner impersonation enabled and the owner known, this is the
    /// owner's uid/gid with the operator's supplementary gids; otherwise the
    /// active identity.
    pub fn credential_for(&self, owner: Option<&Attributes>) -> Credential {
        let mut credential = self.current();
        if self.impersonates_owner() {
            if let Some(attrs) = owner {
                credential.uid = attrs.uid;
                credential.gid = attrs.gid;
            }
        }
        credential
    }
}

impl Default for CredentialManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_AUX_GIDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_default_identity_is_root() {
        let creds = CredentialManager::default();
        assert_eq!(creds.current(), Credential::new(0, 0, vec![]));
    }

    #[test]
    fn test_set_identity_replaces_current() {
        let creds = CredentialManager::default();
        let update = creds.set_identity(1000, 100, vec![4, 24]);
        assert!(!update.is_truncated());
        assert_eq!(creds.current(), Credential::new(1000, 100, vec![4, 24]));
    }

    #[test]
    fn test_gid_limit_capped_at_auth_unix_maximum() {
        let creds = CredentialManager::new(20);
        assert_eq!(creds.max_aux_gids(), MAX_AUTH_UNIX_GIDS);
        let update = creds.set_identity(1, 1, (1..=20).collect());
        assert_eq!(update.dropped_gids, vec![17, 18, 19, 20]);

        let auth = crate::rpc::AuthUnix::new(0, "host", &creds.current());
        assert!(crate::xdr::to_bytes(&auth).is_ok());
    }

    #[test]
    fn test_excess_gids_are_truncated_and_reported() {
        let creds = CredentialManager::default();
        let gids: Vec<u32> = (1..=20).collect();
        let update = creds.set_identity(1, 1, gids);

        assert!(update.is_truncated());
        assert_eq!(update.dropped_gids, vec![17, 18, 19, 20]);
        assert_eq!(creds.current().supplementary_gids.len(), 16);
        assert_eq!(creds.current().supplementary_gids, (1..=16).collect::<Vec<u32>>());
    }

    #[test]
    fn test_snapshot_unaffected_by_later_change() {
        let creds = CredentialManager::default();
        creds.set_identity(10, 10, vec![]);
        let before = creds.current();

        creds.set_identity(20, 20, vec![]);
        let after = creds.current();

        assert_eq!(before.uid, 10);
        assert_eq!(after.uid, 20);
    }

    #[test]
    fn test_concurrent_readers_see_whole_identities() {
        let creds = Arc::new(CredentialManager::default());
        let writer = {
            let creds = creds.clone();
            thread::spawn(move || {
                for i in 0..500u32 {
                    creds.set_identity(i, i, vec![i]);
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let creds = creds.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        let c = creds.current();
                        // uid, gid and gids are always replaced together
                        assert_eq!(c.uid, c.gid);
                        if let Some(g) = c.supplementary_gids.first() {
                            assert_eq!(*g, c.uid);
                        }
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }

    #[test]
    fn test_owner_impersonation() {
        let creds = CredentialManager::default();
        creds.set_identity(1, 1, vec![50]);
        let owner = Attributes::file(7, 0, 1234, 5678);

        // Off by default
        assert_eq!(creds.credential_for(Some(&owner)).uid, 1);

        creds.set_impersonate_owner(true);
        let c = creds.credential_for(Some(&owner));
        assert_eq!((c.uid, c.gid), (1234, 5678));
        assert_eq!(c.supplementary_gids, vec![50]);

        // Unknown owner falls back to the operator identity
        assert_eq!(creds.credential_for(None).uid, 1);
    }
}
