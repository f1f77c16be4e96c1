use crate::hashing::ContentHash;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

/// 单次运行内的哈希 → 结果缓存
///
/// 每个哈希对应一个 [`OnceCell`]，取格子的动作在锁内完成；
/// 同一哈希的并发调用者只有一个会执行初始化，其余等待并读取它的结果。
/// 初始化失败时格子保持为空；致命失败另行记入 `rejected`，本次运行内不再重试。
pub struct RunCache<T> {
    cells: Mutex<HashMap<ContentHash, Arc<OnceCell<T>>>>,
    rejected: Mutex<HashMap<ContentHash, String>>,
}

impl<T> Default for RunCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RunCache<T> {
    pub fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
            rejected: Mutex::new(HashMap::new()),
        }
    }

    /// 记录致命失败，后续同哈希的调用直接复用失败信息
    pub fn reject(&self, hash: &ContentHash, detail: impl Into<String>) {
        self.rejected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(hash.clone())
            .or_insert_with(|| detail.into());
    }

    pub fn rejection(&self, hash: &ContentHash) -> Option<String> {
        self.rejected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(hash)
            .cloned()
    }

    pub fn cell(&self, hash: &ContentHash) -> Arc<OnceCell<T>> {
        let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        cells
            .entry(hash.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// 已成功初始化的条目数
    pub fn len(&self) -> usize {
        self.cells
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|c| c.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> RunCache<T> {
    pub fn get(&self, hash: &ContentHash) -> Option<T> {
        self.cells
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(hash)
            .and_then(|c| c.get().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Message;
    use crate::hashing::ContentHasher;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn hash(text: &str) -> ContentHash {
        ContentHasher::new().hash_messages(&[Message::user(text, 0)])
    }

    #[tokio::test]
    async fn test_same_hash_initialised_once() {
        let cache: Arc<RunCache<String>> = Arc::new(RunCache::new());
        let inits = Arc::new(AtomicUsize::new(0));
        let h = hash("same");

        let tasks = (0..8).map(|_| {
            let cache = cache.clone();
            let inits = inits.clone();
            let h = h.clone();
            tokio::spawn(async move {
                let cell = cache.cell(&h);
                let value = cell
                    .get_or_init(|| async {
                        inits.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        "value".to_string()
                    })
                    .await;
                value.clone()
            })
        });
        for result in futures::future::join_all(tasks).await {
            assert_eq!(result.unwrap(), "value");
        }
        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(&h).as_deref(), Some("value"));
    }

    #[tokio::test]
    async fn test_failed_init_leaves_cell_empty() {
        let cache: RunCache<u32> = RunCache::new();
        let h = hash("flaky");

        let cell = cache.cell(&h);
        let first = cell.get_or_try_init(|| async { Err::<u32, _>("boom") }).await;
        assert!(first.is_err());
        assert!(cache.is_empty());

        let cell = cache.cell(&h);
        let second = cell.get_or_try_init(|| async { Ok::<_, &str>(7) }).await;
        assert_eq!(second, Ok(&7));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_rejection_kept_for_the_run() {
        let cache: RunCache<u32> = RunCache::new();
        let h = hash("refused");
        assert_eq!(cache.rejection(&h), None);

        cache.reject(&h, "model not found");
        cache.reject(&h, "second detail ignored");
        assert_eq!(cache.rejection(&h).as_deref(), Some("model not found"));
        assert_eq!(cache.rejection(&hash("other")), None);
        assert!(cache.is_empty());
    }
}
