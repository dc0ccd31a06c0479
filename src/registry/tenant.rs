use super::snapshot::TypeSnapshot;
use crate::types::{PluginType, TypeKind};
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// 租户的类型空间: 无锁读取的快照 + 串行化写者的互斥锁
pub(crate) struct TenantScope {
    snapshot: ArcSwap<TypeSnapshot>,
    write_lock: Mutex<()>,
    /// 回退到系统租户的查找结果 (含未命中), 附带系统快照代数
    fallback: RwLock<HashMap<(TypeKind, String), (u64, Option<PluginType>)>>,
}

impl TenantScope {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(TypeSnapshot::default()),
            write_lock: Mutex::new(()),
            fallback: RwLock::new(HashMap::new()),
        }
    }

    pub fn load(&self) -> Arc<TypeSnapshot> {
        self.snapshot.load_full()
    }

    /// 在快照克隆上执行修改并整体替换
    pub fn update<R>(&self, f: impl FnOnce(&mut TypeSnapshot) -> R) -> R {
        let _guard = self.write_lock.lock();
        let mut next = TypeSnapshot::clone(&self.snapshot.load());
        let result = f(&mut next);
        self.snapshot.store(Arc::new(next));
        self.fallback.write().clear();
        result
    }

    pub fn cached_fallback(&self, kind: TypeKind, id: &str, generation: u64) -> Option<Option<PluginType>> {
        let cache = self.fallback.read();
        match cache.get(&(kind, id.to_string())) {
            Some((cached_generation, ty)) if *cached_generation == generation => Some(ty.clone()),
            _ => None,
        }
    }

    pub fn cache_fallback(&self, kind: TypeKind, id: &str, generation: u64, ty: Option<PluginType>) {
        self.fallback
            .write()
            .insert((kind, id.to_string()), (generation, ty));
    }

    #[cfg(test)]
    pub fn cached_entries(&self) -> usize {
        self.fallback.read().len()
    }
}
