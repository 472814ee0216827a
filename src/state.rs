use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::warn;

/// Lookup side of anything templates and conditions can read variables from.
pub trait VariableSource {
    fn lookup(&self, name: &str) -> Option<Value>;
}

impl VariableSource for Map<String, Value> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

impl VariableSource for std::collections::HashMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

#[derive(Clone)]
struct BranchScope {
    branch: String,
    writers: Arc<DashMap<String, String>>,
}

tokio::task_local! {
    static BRANCH: BranchScope;
}

/// Shared key/value state of one flow execution.
///
/// Values keep their JSON type so integers survive untouched. Clones share
/// the same underlying map. Writes are last-write-wins; when two branches of
/// the same parallel block write one key a warning is logged.
#[derive(Clone, Debug, Default)]
pub struct StateBag {
    values: Arc<DashMap<String, Value>>,
}

impl StateBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        let bag = Self::new();
        bag.extend(map);
        bag
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|v| v.value().clone())
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let _ = BRANCH.try_with(|scope| {
            let previous = scope
                .writers
                .insert(key.clone(), scope.branch.clone());
            if let Some(other) = previous.filter(|other| *other != scope.branch) {
                warn!(
                    key = %key,
                    first = %other,
                    second = %scope.branch,
                    "state key written by concurrent parallel branches"
                );
            }
        });
        self.values.insert(key, value);
    }

    /// Write without parallel-branch bookkeeping, for engine metadata.
    pub(crate) fn set_untracked(&self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    pub fn extend(&self, map: Map<String, Value>) {
        for (k, v) in map {
            self.values.insert(k, v);
        }
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values.remove(key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Point-in-time copy, ordered by key.
    pub fn snapshot(&self) -> Map<String, Value> {
        let mut entries: Vec<(String, Value)> = self
            .values
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().collect()
    }

    /// Run `fut` as branch `branch` of a parallel block whose writes are
    /// tracked in `writers`.
    pub(crate) async fn in_branch<F: Future>(
        branch: String,
        writers: Arc<DashMap<String, String>>,
        fut: F,
    ) -> F::Output {
        BRANCH.scope(BranchScope { branch, writers }, fut).await
    }
}

impl VariableSource for StateBag {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clones_share_values() {
        let bag = StateBag::new();
        let other = bag.clone();
        other.set("n", json!(9007199254740993u64));
        assert_eq!(bag.get("n"), Some(json!(9007199254740993u64)));
        assert_eq!(bag.len(), 1);
    }

    #[test]
    fn snapshot_is_sorted_copy() {
        let bag = StateBag::from_map(
            json!({"b": 2, "a": "x"}).as_object().cloned().unwrap_or_default(),
        );
        let snap = bag.snapshot();
        assert_eq!(snap.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        bag.set("c", json!(true));
        assert!(!snap.contains_key("c"));
    }

    #[tokio::test]
    async fn branch_writes_are_last_write_wins() {
        let bag = StateBag::new();
        let writers = Arc::new(DashMap::new());
        let first = bag.clone();
        StateBag::in_branch("left".into(), writers.clone(), async move {
            first.set("shared", json!(1));
        })
        .await;
        let second = bag.clone();
        StateBag::in_branch("right".into(), writers.clone(), async move {
            second.set("shared", json!(2));
        })
        .await;
        assert_eq!(bag.get("shared"), Some(json!(2)));
        assert_eq!(writers.get("shared").map(|w| w.clone()), Some("right".to_string()));
    }
}
