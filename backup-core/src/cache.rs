//! 查询结果缓存
//!
//! 缓存快照列表、仓库统计和文件列表，避免重复启动引擎进程。
//! 容量按条目数估算，超出上限时先淘汰陈旧条目，再按创建时间从旧到新淘汰。
//!
//! 查询期间发生的失效不能被查询结果覆盖：调用方在启动引擎前取得
//! [`CacheGeneration`]，写回时用 [`QueryResultCache::put_if_unchanged`]。

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::constants::cache;
use crate::models::{FileEntry, RepoStats, Snapshot};
use chrono::{DateTime, Duration, Utc};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Snapshots(i64),
    Stats(i64),
    Files { snapshot_id: String, path: String },
}

impl CacheKey {
    pub fn files(snapshot_id: impl Into<String>, path: impl Into<String>) -> Self {
        CacheKey::Files {
            snapshot_id: snapshot_id.into(),
            path: path.into(),
        }
    }

    fn repository_id(&self) -> Option<i64> {
        match self {
            CacheKey::Snapshots(id) | CacheKey::Stats(id) => Some(*id),
            CacheKey::Files { .. } => None,
        }
    }

    fn scope(&self) -> Scope {
        match self {
            CacheKey::Snapshots(id) | CacheKey::Stats(id) => Scope::Repository(*id),
            CacheKey::Files { snapshot_id, .. } => Scope::Snapshot(snapshot_id.clone()),
        }
    }
}

/// 失效批量作用的范围
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Scope {
    Key(CacheKey),
    Repository(i64),
    Snapshot(String),
}

/// 缓存失效计数，查询开始前取得
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CacheGeneration(u64);

/// 缓存值的估算占用
pub trait CacheWeight {
    fn approximate_bytes(&self) -> usize;
}

impl CacheWeight for Vec<Snapshot> {
    fn approximate_bytes(&self) -> usize {
        self.len().max(1) * cache::SNAPSHOT_ENTRY_BYTES
    }
}

impl CacheWeight for Vec<FileEntry> {
    fn approximate_bytes(&self) -> usize {
        self.len().max(1) * cache::FILE_ENTRY_BYTES
    }
}

impl CacheWeight for RepoStats {
    fn approximate_bytes(&self) -> usize {
        cache::STATS_ENTRY_BYTES
    }
}

struct CachedEntry {
    value: Arc<dyn Any + Send + Sync>,
    created_at: DateTime<Utc>,
    bytes: usize,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, CachedEntry>,
    total_bytes: usize,
    generation: u64,
    /// 各范围最近一次失效时的计数
    invalidated: HashMap<Scope, u64>,
    cleared_at: u64,
}

impl CacheState {
    fn mark(&mut self, scope: Scope) {
        self.generation += 1;
        self.invalidated.insert(scope, self.generation);
    }

    /// `since` 之后是否有影响该键的失效
    fn invalidated_since(&self, key: &CacheKey, since: CacheGeneration) -> bool {
        let after = |scope: &Scope| self.invalidated.get(scope).is_some_and(|g| *g > since.0);
        self.cleared_at > since.0 || after(&key.scope()) || after(&Scope::Key(key.clone()))
    }

    fn remove(&mut self, key: &CacheKey) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.total_bytes = self.total_bytes.saturating_sub(entry.bytes);
                true
            }
            None => false,
        }
    }
}

pub struct QueryResultCache {
    clock: Arc<dyn Clock>,
    state: Mutex<CacheState>,
    max_bytes: Mutex<usize>,
    stale_after: Duration,
}

impl QueryResultCache {
    pub fn new(clock: Arc<dyn Clock>, max_size_mb: u64, stale_after_minutes: u64) -> Self {
        Self {
            clock,
            state: Mutex::new(CacheState::default()),
            max_bytes: Mutex::new(mb_to_bytes(max_size_mb)),
            stale_after: Duration::minutes(stale_after_minutes as i64),
        }
    }

    pub fn from_config(clock: Arc<dyn Clock>, config: &CacheConfig) -> Self {
        Self::new(clock, config.max_size_mb, config.stale_after_minutes)
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn max_bytes(&self) -> usize {
        *self.max_bytes.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_max_size_mb(&self, max_size_mb: u64) {
        *self.max_bytes.lock().unwrap_or_else(|e| e.into_inner()) = mb_to_bytes(max_size_mb);
        let max = self.max_bytes();
        let now = self.clock.now();
        self.evict_to(&mut self.state(), max, now);
    }

    /// 读取缓存值，不检查有效期
    pub fn get<T>(&self, key: &CacheKey) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let state = self.state();
        state
            .entries
            .get(key)
            .and_then(|entry| entry.value.downcast_ref::<T>())
            .cloned()
    }

    /// 只返回未超过 max_age 的缓存值
    pub fn get_valid<T>(&self, key: &CacheKey, max_age: Duration) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let now = self.clock.now();
        let state = self.state();
        state
            .entries
            .get(key)
            .filter(|entry| now - entry.created_at < max_age)
            .and_then(|entry| entry.value.downcast_ref::<T>())
            .cloned()
    }

    pub fn generation(&self) -> CacheGeneration {
        CacheGeneration(self.state().generation)
    }

    pub fn put<T>(&self, key: CacheKey, value: T)
    where
        T: CacheWeight + Send + Sync + 'static,
    {
        let max = self.max_bytes();
        let mut state = self.state();
        self.insert(&mut state, key, value, max);
    }

    /// 只有 `since` 之后没有相关失效时才写入，返回是否写入
    pub fn put_if_unchanged<T>(&self, key: CacheKey, value: T, since: CacheGeneration) -> bool
    where
        T: CacheWeight + Send + Sync + 'static,
    {
        let max = self.max_bytes();
        let mut state = self.state();
        if state.invalidated_since(&key, since) {
            debug!("查询期间缓存已失效，丢弃结果: {:?}", key);
            return false;
        }
        self.insert(&mut state, key, value, max);
        true
    }

    fn insert<T>(&self, state: &mut CacheState, key: CacheKey, value: T, max: usize)
    where
        T: CacheWeight + Send + Sync + 'static,
    {
        let now = self.clock.now();
        let bytes = value.approximate_bytes();
        state.remove(&key);
        state.total_bytes += bytes;
        state.entries.insert(
            key,
            CachedEntry {
                value: Arc::new(value),
                created_at: now,
                bytes,
            },
        );
        if state.total_bytes > max {
            self.evict_to(state, max, now);
        }
    }

    /// 条目存在且年龄小于 max_age
    pub fn is_valid(&self, key: &CacheKey, max_age: Duration) -> bool {
        let now = self.clock.now();
        self.state()
            .entries
            .get(key)
            .is_some_and(|entry| now - entry.created_at < max_age)
    }

    pub fn invalidate(&self, key: &CacheKey) {
        let mut state = self.state();
        state.mark(Scope::Key(key.clone()));
        if state.remove(key) {
            debug!("缓存失效: {:?}", key);
        }
    }

    /// 清除仓库的快照列表和统计，文件列表不受影响
    pub fn invalidate_repository(&self, repository_id: i64) {
        let mut state = self.state();
        state.mark(Scope::Repository(repository_id));
        state.remove(&CacheKey::Snapshots(repository_id));
        state.remove(&CacheKey::Stats(repository_id));
        debug!("仓库 {} 的查询缓存已清除", repository_id);
    }

    /// 清除某个快照下的全部文件列表
    pub fn invalidate_snapshot_files(&self, snapshot_id: &str) {
        let mut state = self.state();
        state.mark(Scope::Snapshot(snapshot_id.to_string()));
        let keys: Vec<CacheKey> = state
            .entries
            .keys()
            .filter(|key| matches!(key, CacheKey::Files { snapshot_id: id, .. } if id == snapshot_id))
            .cloned()
            .collect();
        for key in keys {
            state.remove(&key);
        }
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.entries.clear();
        state.total_bytes = 0;
        state.invalidated.clear();
        state.generation += 1;
        state.cleared_at = state.generation;
    }

    pub fn approximate_size(&self) -> usize {
        self.state().total_bytes
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 缓存中涉及的仓库
    pub fn cached_repositories(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .state()
            .entries
            .keys()
            .filter_map(CacheKey::repository_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn evict_to(&self, state: &mut CacheState, max: usize, now: DateTime<Utc>) {
        if state.total_bytes <= max {
            return;
        }

        let stale: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(_, entry)| now - entry.created_at > self.stale_after)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            state.remove(&key);
        }

        if state.total_bytes > max {
            let mut by_age: Vec<(DateTime<Utc>, CacheKey)> = state
                .entries
                .iter()
                .map(|(key, entry)| (entry.created_at, key.clone()))
                .collect();
            by_age.sort_by(|a, b| a.0.cmp(&b.0));
            for (_, key) in by_age {
                if state.total_bytes <= max {
                    break;
                }
                state.remove(&key);
            }
        }
        debug!("缓存淘汰完成，当前估算占用 {} 字节", state.total_bytes);
    }
}

fn mb_to_bytes(mb: u64) -> usize {
    (mb as usize).saturating_mul(1024 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn snapshot(id: &str) -> Snapshot {
        Snapshot {
            id: id.to_string(),
            short_id: None,
            time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            hostname: "h".into(),
            username: "u".into(),
            paths: vec!["/etc".into()],
            tags: vec![],
            parent: None,
        }
    }

    fn setup(max_mb: u64) -> (Arc<ManualClock>, QueryResultCache) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ));
        let cache = QueryResultCache::new(clock.clone(), max_mb, 60);
        (clock, cache)
    }

    #[test]
    fn test_validity_boundary() {
        let (clock, cache) = setup(100);
        let key = CacheKey::Snapshots(1);
        cache.put(key.clone(), vec![snapshot("a")]);

        let max_age = Duration::minutes(5);
        clock.advance(Duration::minutes(4) + Duration::seconds(59));
        assert!(cache.is_valid(&key, max_age));
        assert!(cache.get_valid::<Vec<Snapshot>>(&key, max_age).is_some());

        clock.advance(Duration::seconds(2));
        assert!(!cache.is_valid(&key, max_age));
        assert!(cache.get_valid::<Vec<Snapshot>>(&key, max_age).is_none());
        // 过期条目仍可直接读取
        assert!(cache.get::<Vec<Snapshot>>(&key).is_some());
    }

    #[test]
    fn test_invalidate_repository_only_touches_that_repository() {
        let (_, cache) = setup(100);
        cache.put(CacheKey::Snapshots(1), vec![snapshot("a")]);
        cache.put(CacheKey::Stats(1), RepoStats::default());
        cache.put(CacheKey::Snapshots(2), vec![snapshot("b")]);
        cache.put(CacheKey::Stats(2), RepoStats::default());
        cache.put(CacheKey::files("a", "/"), Vec::<FileEntry>::new());

        cache.invalidate_repository(1);

        assert!(cache.get::<Vec<Snapshot>>(&CacheKey::Snapshots(1)).is_none());
        assert!(cache.get::<RepoStats>(&CacheKey::Stats(1)).is_none());
        assert!(cache.get::<Vec<Snapshot>>(&CacheKey::Snapshots(2)).is_some());
        assert!(cache.get::<RepoStats>(&CacheKey::Stats(2)).is_some());
        assert!(cache.get::<Vec<FileEntry>>(&CacheKey::files("a", "/")).is_some());
        assert_eq!(cache.cached_repositories(), vec![2]);
    }

    #[test]
    fn test_wrong_type_is_a_miss() {
        let (_, cache) = setup(100);
        cache.put(CacheKey::Stats(1), RepoStats::default());
        assert!(cache.get::<Vec<Snapshot>>(&CacheKey::Stats(1)).is_none());
    }

    #[test]
    fn test_size_accounting_and_replace() {
        let (_, cache) = setup(100);
        cache.put(CacheKey::Snapshots(1), vec![snapshot("a"), snapshot("b")]);
        assert_eq!(cache.approximate_size(), 2 * cache::SNAPSHOT_ENTRY_BYTES);
        cache.put(CacheKey::Snapshots(1), vec![snapshot("a")]);
        assert_eq!(cache.approximate_size(), cache::SNAPSHOT_ENTRY_BYTES);
        cache.put(CacheKey::Stats(1), RepoStats::default());
        assert_eq!(
            cache.approximate_size(),
            cache::SNAPSHOT_ENTRY_BYTES + cache::STATS_ENTRY_BYTES
        );
        cache.clear();
        assert_eq!(cache.approximate_size(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_overflow_drops_stale_then_oldest() {
        let (clock, cache) = setup(1);
        let listing = |n: usize| -> Vec<FileEntry> {
            (0..n)
                .map(|i| FileEntry {
                    name: format!("f{i}"),
                    path: format!("/f{i}"),
                    kind: crate::models::FileKind::File,
                    size: 1,
                    mode: 0o644,
                    mtime: None,
                    uid: 0,
                    gid: 0,
                    user: String::new(),
                    group: String::new(),
                })
                .collect()
        };
        // 每个 800 条 * 512B = 400KB
        cache.put(CacheKey::files("s1", "/"), listing(800));
        clock.advance(Duration::minutes(90));
        cache.put(CacheKey::files("s2", "/"), listing(800));
        clock.advance(Duration::minutes(1));
        cache.put(CacheKey::files("s3", "/"), listing(800));

        // s1 已陈旧，先被淘汰
        assert!(cache.get::<Vec<FileEntry>>(&CacheKey::files("s1", "/")).is_none());
        assert!(cache.get::<Vec<FileEntry>>(&CacheKey::files("s2", "/")).is_some());
        assert!(cache.get::<Vec<FileEntry>>(&CacheKey::files("s3", "/")).is_some());

        clock.advance(Duration::minutes(1));
        cache.put(CacheKey::files("s4", "/"), listing(800));
        // 没有陈旧条目时按时间从旧到新淘汰
        assert!(cache.get::<Vec<FileEntry>>(&CacheKey::files("s2", "/")).is_none());
        assert!(cache.get::<Vec<FileEntry>>(&CacheKey::files("s4", "/")).is_some());
        assert!(cache.approximate_size() <= 1024 * 1024);
    }

    #[test]
    fn test_result_started_before_invalidation_is_dropped() {
        let (_, cache) = setup(100);
        let before = cache.generation();
        cache.invalidate_repository(1);

        assert!(!cache.put_if_unchanged(CacheKey::Snapshots(1), vec![snapshot("old")], before));
        assert!(cache.get::<Vec<Snapshot>>(&CacheKey::Snapshots(1)).is_none());
        // 其他仓库不受影响
        assert!(cache.put_if_unchanged(CacheKey::Stats(2), RepoStats::default(), before));

        let after = cache.generation();
        assert!(cache.put_if_unchanged(CacheKey::Snapshots(1), vec![snapshot("new")], after));
        assert!(cache.get::<Vec<Snapshot>>(&CacheKey::Snapshots(1)).is_some());
    }

    #[test]
    fn test_clear_and_snapshot_invalidation_block_stale_writes() {
        let (_, cache) = setup(100);
        let before = cache.generation();
        cache.invalidate_snapshot_files("a");
        assert!(!cache.put_if_unchanged(CacheKey::files("a", "/"), Vec::<FileEntry>::new(), before));
        assert!(cache.put_if_unchanged(CacheKey::files("b", "/"), Vec::<FileEntry>::new(), before));

        let before = cache.generation();
        cache.clear();
        assert!(!cache.put_if_unchanged(CacheKey::Stats(3), RepoStats::default(), before));
        assert!(cache.is_empty());

        let before = cache.generation();
        cache.invalidate(&CacheKey::Stats(3));
        assert!(!cache.put_if_unchanged(CacheKey::Stats(3), RepoStats::default(), before));
        assert!(cache.put_if_unchanged(CacheKey::Snapshots(3), vec![snapshot("x")], before));
    }

    #[test]
    fn test_invalidate_snapshot_files() {
        let (_, cache) = setup(100);
        cache.put(CacheKey::files("a", "/"), Vec::<FileEntry>::new());
        cache.put(CacheKey::files("a", "/etc"), Vec::<FileEntry>::new());
        cache.put(CacheKey::files("b", "/"), Vec::<FileEntry>::new());

        cache.invalidate_snapshot_files("a");
        assert_eq!(cache.len(), 1);
        assert!(cache.get::<Vec<FileEntry>>(&CacheKey::files("b", "/")).is_some());
    }
}
