//! Registry of live environments
//!
//! Every environment registers its chain state here when it is constructed.
//! Stages snapshot the registry before and after running a body to learn which
//! environments moved, and replay those moves on a cache hit.
//!
//! The registry is append-only for its lifetime. The number of live
//! environments is expected to be small, so lookups are linear scans under a
//! single mutex.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, warn};

use crate::environment::EnvIdentity;
use crate::logging::status;
use crate::rerun::{RerunOverride, RerunScope};

/// Chain state of one environment, shared between its owner and the registry
#[derive(Debug)]
pub struct EnvState {
    identity: EnvIdentity,
    seed: String,
    hash: RwLock<String>,
}

impl EnvState {
    pub fn new(identity: EnvIdentity, seed: String) -> Self {
        Self {
            identity,
            hash: RwLock::new(seed.clone()),
            seed,
        }
    }

    pub fn identity(&self) -> &EnvIdentity {
        &self.identity
    }

    /// Hash the environment started from
    pub fn seed(&self) -> &str {
        &self.seed
    }

    pub fn hash(&self) -> String {
        match self.hash.read() {
            Ok(hash) => hash.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_hash(&self, hash: String) {
        match self.hash.write() {
            Ok(mut current) => *current = hash,
            Err(poisoned) => *poisoned.into_inner() = hash,
        }
    }
}

/// One environment's hash transition recorded across a stage call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashDelta {
    pub identity: EnvIdentity,
    pub before: String,
    pub after: String,
}

/// Found while replaying a recorded delta
///
/// The environment was not at the hash the recording started from, which
/// usually means it changed out of band (a replaced host, a manual edit). The
/// replay still force-sets the recorded `after` hash. Nothing checks that the
/// environment's actual content matches that hash; this is a known gap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyWarning {
    pub identity: EnvIdentity,
    pub expected: String,
    pub actual: String,
}

impl std::fmt::Display for ConsistencyWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "expected env {} to have hash {} but got {}",
            self.identity, self.expected, self.actual
        )
    }
}

/// Hashes of every registered environment at one instant, in registration order
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    hashes: Vec<(EnvIdentity, String)>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Latest hash recorded for an identity
    pub fn get(&self, identity: &EnvIdentity) -> Option<&str> {
        self.hashes
            .iter()
            .rev()
            .find(|(id, _)| id == identity)
            .map(|(_, hash)| hash.as_str())
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    envs: Mutex<Vec<Arc<EnvState>>>,
    resume_points: Mutex<HashMap<EnvIdentity, HashDelta>>,
    rerun: RerunOverride,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn envs(&self) -> MutexGuard<'_, Vec<Arc<EnvState>>> {
        self.envs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn resume_points(&self) -> MutexGuard<'_, HashMap<EnvIdentity, HashDelta>> {
        self.resume_points
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an environment's chain state
    ///
    /// If a stage replay parked a resume point for this identity, the
    /// environment jumps to the recorded hash.
    pub fn register(&self, state: Arc<EnvState>) -> Option<ConsistencyWarning> {
        let resume = self.resume_points().remove(state.identity());

        let warning = resume.and_then(|delta| {
            let warning = check_drift(&delta, &state.hash());
            state.set_hash(delta.after.clone());
            debug!(
                env = %delta.identity,
                hash = %delta.after,
                "resumed environment from stage replay"
            );
            warning
        });

        self.envs().push(state);
        warning
    }

    pub fn len(&self) -> usize {
        self.envs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.envs().is_empty()
    }

    /// Most recently registered environment with this identity
    pub fn find(&self, identity: &EnvIdentity) -> Option<Arc<EnvState>> {
        self.envs()
            .iter()
            .rev()
            .find(|state| state.identity() == identity)
            .cloned()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            hashes: self
                .envs()
                .iter()
                .map(|state| (state.identity().clone(), state.hash()))
                .collect(),
        }
    }

    /// Transitions between two snapshots of this registry
    ///
    /// Environments registered after `before` was taken are compared against
    /// the seed they started from.
    pub fn diff(&self, before: &Snapshot, after: &Snapshot) -> Vec<HashDelta> {
        let envs = self.envs();
        let mut deltas = Vec::new();

        for (index, (identity, after_hash)) in after.hashes.iter().enumerate() {
            let before_hash = match before.hashes.get(index) {
                Some((_, hash)) => hash.clone(),
                None => match envs.get(index) {
                    Some(state) => state.seed().to_string(),
                    None => continue,
                },
            };

            if &before_hash != after_hash {
                deltas.push(HashDelta {
                    identity: identity.clone(),
                    before: before_hash,
                    after: after_hash.clone(),
                });
            }
        }

        deltas
    }

    /// Replay recorded transitions onto the registered environments
    ///
    /// Identities that are not registered yet become resume points for the
    /// next environment registered under that identity.
    pub fn apply_deltas(&self, deltas: &[HashDelta]) -> Vec<ConsistencyWarning> {
        let mut warnings = Vec::new();

        for delta in deltas {
            match self.find(&delta.identity) {
                Some(state) => {
                    if let Some(warning) = check_drift(delta, &state.hash()) {
                        warnings.push(warning);
                    }
                    state.set_hash(delta.after.clone());
                }
                None => {
                    debug!(
                        env = %delta.identity,
                        hash = %delta.after,
                        "environment not registered, parking resume point"
                    );
                    self.resume_points()
                        .insert(delta.identity.clone(), delta.clone());
                }
            }
        }

        warnings
    }

    pub fn rerun(&self) -> &RerunOverride {
        &self.rerun
    }

    /// Open a force-rerun scope on this registry
    pub fn force_rerun(&self) -> RerunScope<'_> {
        self.rerun.enter()
    }
}

fn check_drift(delta: &HashDelta, actual: &str) -> Option<ConsistencyWarning> {
    if delta.before == actual {
        return None;
    }

    let warning = ConsistencyWarning {
        identity: delta.identity.clone(),
        expected: delta.before.clone(),
        actual: actual.to_string(),
    };
    warn!(
        env = %warning.identity,
        status = status::DRIFT,
        expected = %warning.expected,
        actual = %warning.actual,
        "{}; did the host change?",
        warning
    );
    Some(warning)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(path: &str, hash: &str) -> Arc<EnvState> {
        Arc::new(EnvState::new(
            EnvIdentity::new(None, path),
            hash.to_string(),
        ))
    }

    #[test]
    fn test_snapshot_and_diff() {
        let registry = Registry::new();
        let a = state("/a", "a0");
        let b = state("/b", "b0");
        registry.register(Arc::clone(&a));
        registry.register(Arc::clone(&b));

        let before = registry.snapshot();
        a.set_hash("a1".to_string());
        let after = registry.snapshot();

        let deltas = registry.diff(&before, &after);
        assert_eq!(
            deltas,
            vec![HashDelta {
                identity: EnvIdentity::new(None, "/a"),
                before: "a0".to_string(),
                after: "a1".to_string(),
            }]
        );
    }

    #[test]
    fn test_diff_includes_environments_created_mid_call() {
        let registry = Registry::new();
        let before = registry.snapshot();

        let c = state("/c", "c0");
        registry.register(Arc::clone(&c));
        c.set_hash("c1".to_string());

        let deltas = registry.diff(&before, &registry.snapshot());
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].before, "c0");
        assert_eq!(deltas[0].after, "c1");
    }

    #[test]
    fn test_apply_deltas_targets_latest_registration() {
        let registry = Registry::new();
        let old = state("/a", "a0");
        registry.register(Arc::clone(&old));
        old.set_hash("a1".to_string());

        let fresh = state("/a", "a0");
        registry.register(Arc::clone(&fresh));

        let warnings = registry.apply_deltas(&[HashDelta {
            identity: EnvIdentity::new(None, "/a"),
            before: "a0".to_string(),
            after: "a1".to_string(),
        }]);

        assert!(warnings.is_empty());
        assert_eq!(fresh.hash(), "a1");
    }

    #[test]
    fn test_apply_deltas_warns_on_drift_and_proceeds() {
        let registry = Registry::new();
        let a = state("/a", "elsewhere");
        registry.register(Arc::clone(&a));

        let warnings = registry.apply_deltas(&[HashDelta {
            identity: EnvIdentity::new(None, "/a"),
            before: "a0".to_string(),
            after: "a1".to_string(),
        }]);

        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].actual, "elsewhere");
        assert_eq!(a.hash(), "a1");
    }

    #[test]
    fn test_resume_point_applies_on_registration() {
        let registry = Registry::new();
        registry.apply_deltas(&[HashDelta {
            identity: EnvIdentity::new(Some("gpu-1"), "/work"),
            before: "w0".to_string(),
            after: "w5".to_string(),
        }]);

        let late = Arc::new(EnvState::new(
            EnvIdentity::new(Some("gpu-1"), "/work"),
            "w0".to_string(),
        ));
        assert!(registry.register(Arc::clone(&late)).is_none());
        assert_eq!(late.hash(), "w5");

        // Consumed: a second registration starts from its own seed
        let again = Arc::new(EnvState::new(
            EnvIdentity::new(Some("gpu-1"), "/work"),
            "w0".to_string(),
        ));
        registry.register(Arc::clone(&again));
        assert_eq!(again.hash(), "w0");
    }

    #[test]
    fn test_force_rerun_scope() {
        let registry = Registry::new();
        assert!(!registry.rerun().is_active());
        {
            let _scope = registry.force_rerun();
            assert!(registry.rerun().is_active());
        }
        assert!(!registry.rerun().is_active());
    }
}
