//! 文件内容缓存，供静态文件服务的文件系统回退路径使用。
//!
//! 条目以修改时间校验：时间不一致即视为失效，由调用方重新读取并覆盖。

use std::{
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::SystemTime,
};

use bytes::Bytes;
use lru::LruCache;

struct CacheEntry {
    content: Bytes,
    modified_time: SystemTime,
}

pub struct FileCache {
    cache: LruCache<PathBuf, CacheEntry>,
}

impl FileCache {
    /// 容量为 0 时按 1 处理
    pub fn from_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
        }
    }

    pub fn push(&mut self, path: &Path, content: Bytes, modified_time: SystemTime) {
        self.cache.put(
            path.to_path_buf(),
            CacheEntry {
                content,
                modified_time,
            },
        );
    }

    /// 查询有效缓存；修改时间不一致的条目会被顺带移除
    pub fn find(&mut self, path: &Path, current_modified_time: SystemTime) -> Option<Bytes> {
        let stale = match self.cache.get(path) {
            Some(entry) if entry.modified_time == current_modified_time => {
                return Some(entry.content.clone())
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            self.cache.pop(path);
        }
        None
    }

    /// 只缓存不超过阈值的文件
    pub fn should_cache(file_size: u64, threshold: u64) -> bool {
        file_size <= threshold
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }
}
