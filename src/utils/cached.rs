use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Memoizes a keyed async action until `expired` says the value is stale
pub struct Cached<K, R, A, E> {
    action: A,
    expired: E,
    cache: Arc<Mutex<HashMap<K, R>>>,
}

impl<K, R, A, E, Fut> Cached<K, R, A, E>
where
    K: Eq + Hash + Clone,
    R: Clone,
    A: Fn(K) -> Fut,
    Fut: Future<Output = anyhow::Result<R>>,
    E: Fn(&R) -> bool,
{
    pub fn new(action: A, expired: E) -> Self {
        Self::with_cache(action, expired, HashMap::new())
    }

    /// Starts from an already populated cache
    pub fn with_cache(action: A, expired: E, cache: HashMap<K, R>) -> Self {
        Self {
            action,
            expired,
            cache: Arc::new(Mutex::new(cache)),
        }
    }

    pub async fn get(&self, key: K) -> anyhow::Result<R> {
        if let Some(item) = self.cache.lock().await.get(&key) {
            if !(self.expired)(item) {
                return Ok(item.clone());
            }
        }

        let item = (self.action)(key.clone()).await?;
        self.cache.lock().await.insert(key, item.clone());

        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_cached_until_expired() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let cached = Cached::new(
            move |key: String| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok((key, n)) }
            },
            |(_, n): &(String, u32)| *n >= 2,
        );

        assert_eq!(cached.get("a".to_string()).await.unwrap().1, 1);
        assert_eq!(cached.get("a".to_string()).await.unwrap().1, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // a different key misses
        assert_eq!(cached.get("b".to_string()).await.unwrap().1, 2);
        // the cached value for "b" is expired and gets refreshed every time
        assert_eq!(cached.get("b".to_string()).await.unwrap().1, 3);
    }

    #[tokio::test]
    async fn test_seeded_cache_skips_action() {
        let seed = HashMap::from([("x".to_string(), 7u32)]);
        let cached = Cached::with_cache(
            |_: String| async { Err(anyhow::anyhow!("should not be called")) },
            |_: &u32| false,
            seed,
        );

        assert_eq!(cached.get("x".to_string()).await.unwrap(), 7);
        assert!(cached.get("y".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let cached = Cached::new(
            move |_: u8| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        anyhow::bail!("transient");
                    }
                    Ok(n)
                }
            },
            |_: &u32| false,
        );

        assert!(cached.get(1).await.is_err());
        assert_eq!(cached.get(1).await.unwrap(), 1);
    }
}
