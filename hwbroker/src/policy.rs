//! Access policy.
//!
//! Acquisition is gated once per open by an external decision service,
//! fronted by a bounded LRU cache. Any failure to reach a decision is a
//! Deny.

use hwbroker_common::config::PolicyConfig;
use hwbroker_common::error::{BrokerError, BrokerResult};
use hwbroker_common::types::{Caller, ClientId, Credentials};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// Failure of the decision service itself.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Decision service unavailable: {0}")]
    Unavailable(String),

    #[error("Cannot read credentials of pid {pid}: {reason}")]
    Process { pid: i32, reason: String },
}

/// Who is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subject {
    pub client: ClientId,
    pub credentials: Credentials,
}

/// External authorization backend.
pub trait DecisionService {
    fn decide(&self, subject: &Subject, privilege: &str) -> Result<bool, PolicyError>;
}

/// Policy seam used by the broker.
pub trait AccessPolicy {
    /// Decide whether `caller` may acquire resources.
    ///
    /// A caller without credentials is an internal error, not a Deny.
    fn check(&mut self, caller: &Caller) -> BrokerResult<Decision>;

    /// Drop anything remembered about `client`.
    fn forget(&mut self, client: ClientId);
}

/// Config-backed decision service: uid and group allow lists.
#[derive(Debug, Clone)]
pub struct GrantTable {
    allow_uids: Vec<u32>,
    allow_gids: Vec<u32>,
    proc_root: PathBuf,
}

impl GrantTable {
    pub fn new(allow_uids: Vec<u32>, allow_gids: Vec<u32>) -> Self {
        Self {
            allow_uids,
            allow_gids,
            proc_root: PathBuf::from("/proc"),
        }
    }

    pub fn from_config(config: &PolicyConfig) -> Self {
        Self::new(config.allow_uids.clone(), config.allow_gids.clone())
    }

    /// Read process status files from somewhere other than `/proc`.
    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    fn supplementary_groups(&self, pid: i32) -> Result<Vec<u32>, PolicyError> {
        let path = self.proc_root.join(pid.to_string()).join("status");
        let status = std::fs::read_to_string(&path).map_err(|e| PolicyError::Process {
            pid,
            reason: e.to_string(),
        })?;
        Ok(parse_groups(&status))
    }
}

/// Extract the `Groups:` line of a `/proc/<pid>/status` document.
fn parse_groups(status: &str) -> Vec<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Groups:"))
        .map(|rest| {
            rest.split_whitespace()
                .filter_map(|g| g.parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

impl DecisionService for GrantTable {
    fn decide(&self, subject: &Subject, _privilege: &str) -> Result<bool, PolicyError> {
        let creds = subject.credentials;
        if self.allow_uids.contains(&creds.uid) {
            return Ok(true);
        }
        if self.allow_gids.is_empty() {
            return Ok(false);
        }
        if self.allow_gids.contains(&creds.gid) {
            return Ok(true);
        }
        let groups = self.supplementary_groups(creds.pid)?;
        Ok(groups.iter().any(|g| self.allow_gids.contains(g)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    client: ClientId,
    uid: u32,
    privilege: String,
}

/// LRU-cached policy over any [`DecisionService`].
pub struct CachedPolicy<S> {
    service: S,
    privilege: String,
    cache: LruCache<CacheKey, bool>,
}

impl<S: DecisionService> CachedPolicy<S> {
    pub fn new(service: S, privilege: impl Into<String>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            service,
            privilege: privilege.into(),
            cache: LruCache::new(capacity),
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

impl<S: DecisionService> AccessPolicy for CachedPolicy<S> {
    fn check(&mut self, caller: &Caller) -> BrokerResult<Decision> {
        let credentials = caller.credentials.ok_or_else(|| {
            BrokerError::Unknown(format!("no credentials for client {}", caller.id))
        })?;
        let key = CacheKey {
            client: caller.id,
            uid: credentials.uid,
            privilege: self.privilege.clone(),
        };

        let allowed = match self.cache.get(&key) {
            Some(&allowed) => allowed,
            None => {
                let subject = Subject {
                    client: caller.id,
                    credentials,
                };
                match self.service.decide(&subject, &self.privilege) {
                    Ok(allowed) => {
                        self.cache.put(key, allowed);
                        allowed
                    }
                    Err(err) => {
                        warn!(client = %caller.id, error = %err, "policy check failed, denying");
                        false
                    }
                }
            }
        };

        debug!(client = %caller.id, uid = credentials.uid, allowed, "policy decision");
        Ok(if allowed { Decision::Allow } else { Decision::Deny })
    }

    fn forget(&mut self, client: ClientId) {
        let stale: Vec<CacheKey> = self
            .cache
            .iter()
            .filter(|(key, _)| key.client == client)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            self.cache.pop(&key);
        }
    }
}

/// Convenience: the production policy stack from configuration.
pub fn from_config(config: &PolicyConfig) -> CachedPolicy<GrantTable> {
    CachedPolicy::new(
        GrantTable::from_config(config),
        config.privilege.clone(),
        config.cache_capacity,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct Scripted {
        calls: Rc<Cell<usize>>,
        fail: Rc<Cell<bool>>,
        allow: bool,
    }

    impl DecisionService for Scripted {
        fn decide(&self, _: &Subject, _: &str) -> Result<bool, PolicyError> {
            self.calls.set(self.calls.get() + 1);
            if self.fail.get() {
                return Err(PolicyError::Unavailable("down".into()));
            }
            Ok(self.allow)
        }
    }

    fn caller(id: u64, uid: u32) -> Caller {
        Caller::new(
            ClientId(id),
            Some(Credentials {
                pid: 100,
                uid,
                gid: uid,
            }),
        )
    }

    #[test]
    fn test_cache_hit_skips_service() {
        let service = Scripted {
            allow: true,
            ..Default::default()
        };
        let calls = service.calls.clone();
        let mut policy = CachedPolicy::new(service, "p", 4);

        assert_eq!(policy.check(&caller(1, 1000)).unwrap(), Decision::Allow);
        assert_eq!(policy.check(&caller(1, 1000)).unwrap(), Decision::Allow);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_lru_eviction() {
        let service = Scripted::default();
        let calls = service.calls.clone();
        let mut policy = CachedPolicy::new(service, "p", 2);

        policy.check(&caller(1, 1)).unwrap();
        policy.check(&caller(2, 2)).unwrap();
        policy.check(&caller(1, 1)).unwrap(); // touch 1
        policy.check(&caller(3, 3)).unwrap(); // evicts 2
        assert_eq!(calls.get(), 3);
        assert_eq!(policy.cached_len(), 2);

        policy.check(&caller(1, 1)).unwrap();
        assert_eq!(calls.get(), 3);
        policy.check(&caller(2, 2)).unwrap();
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn test_service_failure_denies_and_is_not_cached() {
        let service = Scripted {
            allow: true,
            ..Default::default()
        };
        let fail = service.fail.clone();
        let mut policy = CachedPolicy::new(service, "p", 4);

        fail.set(true);
        assert_eq!(policy.check(&caller(1, 0)).unwrap(), Decision::Deny);
        assert_eq!(policy.cached_len(), 0);

        fail.set(false);
        assert_eq!(policy.check(&caller(1, 0)).unwrap(), Decision::Allow);
    }

    #[test]
    fn test_missing_credentials_is_unknown() {
        let mut policy = CachedPolicy::new(Scripted::default(), "p", 4);
        let err = policy.check(&Caller::new(ClientId(9), None)).unwrap_err();
        assert!(matches!(err, BrokerError::Unknown(_)));
    }

    #[test]
    fn test_forget_purges_client() {
        let mut policy = CachedPolicy::new(Scripted::default(), "p", 8);
        policy.check(&caller(1, 1)).unwrap();
        policy.check(&caller(2, 2)).unwrap();
        policy.forget(ClientId(1));
        assert_eq!(policy.cached_len(), 1);
    }

    fn subject(pid: i32, uid: u32, gid: u32) -> Subject {
        Subject {
            client: ClientId(1),
            credentials: Credentials { pid, uid, gid },
        }
    }

    #[test]
    fn test_grant_table_uid_and_groups() {
        let proc_root = TempDir::new().unwrap();
        let pid_dir = proc_root.path().join("42");
        std::fs::create_dir_all(&pid_dir).unwrap();
        std::fs::write(
            pid_dir.join("status"),
            "Name:\tclient\nUid:\t1000\t1000\t1000\t1000\nGroups:\t4 24 997\n",
        )
        .unwrap();

        let table = GrantTable::new(vec![0], vec![997]).with_proc_root(proc_root.path());
        assert!(table.decide(&subject(1, 0, 0), "p").unwrap());
        assert!(table.decide(&subject(42, 1000, 1000), "p").unwrap());
        assert!(table.decide(&subject(7, 1000, 997), "p").unwrap());

        // Unreadable status file.
        assert!(table.decide(&subject(43, 1000, 1000), "p").is_err());
    }

    #[test]
    fn test_grant_table_without_groups_never_reads_proc() {
        let table = GrantTable::new(vec![0], vec![]).with_proc_root("/nonexistent");
        assert!(!table.decide(&subject(1, 1000, 1000), "p").unwrap());
    }

    #[test]
    fn test_unreadable_proc_denies_through_cache() {
        let table = GrantTable::new(vec![], vec![5]).with_proc_root("/nonexistent");
        let mut policy = CachedPolicy::new(table, "p", 4);
        assert_eq!(policy.check(&caller(1, 1000)).unwrap(), Decision::Deny);
    }

    #[test]
    fn test_parse_groups() {
        assert_eq!(parse_groups("Groups:\t1 2 3\n"), vec![1, 2, 3]);
        assert!(parse_groups("Groups:\n").is_empty());
        assert!(parse_groups("Name: x\n").is_empty());
    }
}
