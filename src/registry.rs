use crate::session::{ProcessHandle, SessionKey};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;

type Slot = Arc<tokio::sync::Mutex<Option<ProcessHandle>>>;

/// 会话键 -> 转码进程 的注册表
///
/// 两级锁:
/// - 表锁只覆盖 HashMap 的查找/插入/清理, 从不跨越 `.await`;
/// - 每个键一把异步槽锁, 在启动/终止进程期间持有。
///
/// 同一个键上的操作因此是全序的, 而某个键上缓慢的进程启动不会阻塞其他键。
pub struct SessionRegistry<K: SessionKey> {
    slots: Mutex<HashMap<K, Slot>>,
}

impl<K: SessionKey> Default for SessionRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: SessionKey> SessionRegistry<K> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<K, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 锁定某个键的槽位, 在返回的守卫存活期间该键上的其他操作都会等待
    pub async fn slot(&self, key: &K) -> SlotGuard<'_, K> {
        let slot = {
            let mut slots = self.slots();
            slots.entry(key.clone()).or_default().clone()
        };
        let guard = slot.clone().lock_owned().await;

        SlotGuard {
            registry: self,
            key: key.clone(),
            slot,
            guard: Some(guard),
        }
    }

    /// 当前存在槽位的键 (含正在启动中的)
    pub fn keys(&self) -> Vec<K> {
        self.slots().keys().cloned().collect()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.slots().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 槽位为空且没有其他任务引用时从表中删除
    ///
    /// 获取槽位必须先拿表锁, 因此在表锁内观察到的引用计数是可靠的。
    fn prune(&self, key: &K, slot: &Slot) {
        let mut slots = self.slots();
        let Some(current) = slots.get(key) else {
            return;
        };
        if !Arc::ptr_eq(current, slot) || Arc::strong_count(slot) > 2 {
            return;
        }
        let empty = match slot.try_lock() {
            Ok(inner) => inner.is_none(),
            Err(_) => false,
        };
        if empty {
            slots.remove(key);
        }
    }
}

/// 某个键的独占访问权
pub struct SlotGuard<'a, K: SessionKey> {
    registry: &'a SessionRegistry<K>,
    key: K,
    slot: Slot,
    guard: Option<OwnedMutexGuard<Option<ProcessHandle>>>,
}

impl<K: SessionKey> SlotGuard<'_, K> {
    fn inner(&mut self) -> &mut Option<ProcessHandle> {
        self.guard
            .as_deref_mut()
            .unwrap_or_else(|| unreachable!("slot guard released before drop"))
    }

    pub fn get(&mut self) -> Option<&mut ProcessHandle> {
        self.inner().as_mut()
    }

    /// 放入新句柄; 调用方应已终止旧句柄, 若仍有旧句柄则原样交还
    pub fn put(&mut self, handle: ProcessHandle) -> Option<ProcessHandle> {
        self.inner().replace(handle)
    }

    pub fn take(&mut self) -> Option<ProcessHandle> {
        self.inner().take()
    }
}

impl<K: SessionKey> Drop for SlotGuard<'_, K> {
    fn drop(&mut self) {
        // 先释放槽锁, 引用计数回落到 表 + self.slot
        drop(self.guard.take());
        self.registry.prune(&self.key, &self.slot);
    }
}
