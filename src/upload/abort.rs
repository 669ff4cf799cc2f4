use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use super::types::UploadId;

/// Cancellation handles of one tracked id
#[derive(Debug, Clone)]
pub struct Lifeline {
    /// Cancelled when the id is aborted, or when the uploader is torn down
    pub abort: CancellationToken,
    /// Cancelled once the id reached a terminal state, or on flush
    pub settled: CancellationToken,
    pub generation: u64,
}

#[derive(Debug)]
struct Registry {
    root: CancellationToken,
    lifelines: HashMap<UploadId, Lifeline>,
    generation: u64,
}

/// Abort signals keyed by id, shared by every stage of one uploader.
///
/// Lifelines live until the next [`reset`](AbortRegistry::reset), so a stage
/// that picks up an already aborted item still sees a cancelled token.
#[derive(Debug, Clone)]
pub struct AbortRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl Default for AbortRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                root: CancellationToken::new(),
                lifelines: HashMap::new(),
                generation: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // Critical sections never panic, a poisoned lock still holds a valid map
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts tracking `id` for the current epoch
    pub fn register(&self, id: &UploadId) -> Lifeline {
        let mut registry = self.lock();
        registry.generation += 1;

        let lifeline = Lifeline {
            abort: registry.root.child_token(),
            settled: CancellationToken::new(),
            generation: registry.generation,
        };

        if let Some(previous) = registry.lifelines.insert(id.clone(), lifeline.clone()) {
            previous.settled.cancel();
        }

        lifeline
    }

    pub fn lifeline(&self, id: &UploadId) -> Option<Lifeline> {
        self.lock().lifelines.get(id).cloned()
    }

    /// Abort signal of `id`; an untracked id gets a token only teardown cancels
    pub fn signal(&self, id: &UploadId) -> CancellationToken {
        let registry = self.lock();
        match registry.lifelines.get(id) {
            Some(lifeline) => lifeline.abort.clone(),
            None => registry.root.child_token(),
        }
    }

    /// Aborts `id` if it is still active, returns whether it was
    pub fn abort(&self, id: &UploadId) -> bool {
        let registry = self.lock();
        match registry.lifelines.get(id) {
            Some(lifeline) if !lifeline.settled.is_cancelled() && !lifeline.abort.is_cancelled() => {
                lifeline.abort.cancel();
                true
            }
            _ => false,
        }
    }

    /// Aborts every active id, returns the ids that were aborted
    pub fn abort_all(&self) -> Vec<UploadId> {
        let registry = self.lock();
        registry
            .lifelines
            .iter()
            .filter(|(_, lifeline)| !lifeline.settled.is_cancelled() && !lifeline.abort.is_cancelled())
            .map(|(id, lifeline)| {
                lifeline.abort.cancel();
                id.clone()
            })
            .collect()
    }

    /// Marks `id` as no longer active
    pub fn settle(&self, id: &UploadId) {
        if let Some(lifeline) = self.lock().lifelines.get(id) {
            lifeline.settled.cancel();
        }
    }

    pub fn is_tracked(&self, id: &UploadId) -> bool {
        self.lock().lifelines.contains_key(id)
    }

    /// Whether `generation` is still the live registration of `id`
    pub fn is_current(&self, id: &UploadId, generation: u64) -> bool {
        self.lock()
            .lifelines
            .get(id)
            .is_some_and(|lifeline| lifeline.generation == generation)
    }

    pub fn active(&self) -> Vec<UploadId> {
        self.lock()
            .lifelines
            .iter()
            .filter(|(_, lifeline)| !lifeline.settled.is_cancelled() && !lifeline.abort.is_cancelled())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Starts a new epoch: settles and forgets every tracked id
    pub fn reset(&self) {
        let mut registry = self.lock();
        for lifeline in registry.lifelines.values() {
            lifeline.settled.cancel();
        }
        registry.lifelines.clear();
    }

    /// Cancels every outstanding and future signal
    pub fn shutdown(&self) {
        self.lock().root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_only_active_ids() {
        let registry = AbortRegistry::new();
        let a = UploadId::from("a");
        let b = UploadId::from("b");

        let lifeline_a = registry.register(&a);
        let lifeline_b = registry.register(&b);

        assert!(registry.abort(&a));
        assert!(lifeline_a.abort.is_cancelled());
        assert!(!lifeline_b.abort.is_cancelled());

        // second abort and abort of a settled id are no-ops
        assert!(!registry.abort(&a));
        registry.settle(&b);
        assert!(!registry.abort(&b));
        assert!(!lifeline_b.abort.is_cancelled());

        // an aborted id keeps a cancelled signal for late stages
        assert!(registry.signal(&a).is_cancelled());
    }

    #[test]
    fn test_abort_all_and_reset() {
        let registry = AbortRegistry::new();
        let ids: Vec<UploadId> = ["1", "2", "3"].into_iter().map(UploadId::from).collect();
        let lifelines: Vec<_> = ids.iter().map(|id| registry.register(id)).collect();

        registry.settle(&ids[2]);
        let mut aborted = registry.abort_all();
        aborted.sort();
        assert_eq!(aborted, ids[..2].to_vec());
        assert!(registry.active().is_empty());

        registry.reset();
        assert!(!registry.is_tracked(&ids[0]));
        assert!(lifelines.iter().all(|lifeline| lifeline.settled.is_cancelled()));
    }

    #[test]
    fn test_generation_and_shutdown() {
        let registry = AbortRegistry::new();
        let id = UploadId::from("x");

        let first = registry.register(&id);
        let second = registry.register(&id);
        assert!(first.settled.is_cancelled());
        assert!(!registry.is_current(&id, first.generation));
        assert!(registry.is_current(&id, second.generation));

        let untracked = registry.signal(&UploadId::from("y"));
        registry.shutdown();
        assert!(second.abort.is_cancelled());
        assert!(untracked.is_cancelled());
    }
}
