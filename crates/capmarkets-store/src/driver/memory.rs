//! 인메모리 스토어 드라이버.
//!
//! 하나의 `MemoryDriver`가 만든 연결들은 같은 데이터를 공유합니다 (하나의
//! "서버"). 연결을 닫아도 데이터는 유지되므로 재연결 시나리오를 재현할 수
//! 있습니다.

use super::{Scope, StoreDriver, StoreHandle};
use crate::config::StoreConfig;
use crate::document::{validate_identifier, Document, Filter, FindOptions, Update};
use crate::error::{Result, StoreError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct MemoryState {
    collections: RwLock<HashMap<String, Vec<Document>>>,
    next_id: AtomicU64,
}

impl MemoryState {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<Document>>> {
        self.collections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<Document>>> {
        self.collections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 인메모리 드라이버.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    state: Arc<MemoryState>,
    connects: Arc<AtomicU64>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// 지금까지 수립된 연결 수.
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    /// 새 연결을 즉시 만듭니다 (드라이버 트레이트를 거치지 않는 테스트용).
    pub fn open(&self) -> MemoryHandle {
        self.connects.fetch_add(1, Ordering::SeqCst);
        MemoryHandle {
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl StoreDriver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self, _config: &StoreConfig) -> Result<Arc<dyn StoreHandle>> {
        Ok(Arc::new(self.open()))
    }
}

/// 인메모리 연결.
pub struct MemoryHandle {
    state: Arc<MemoryState>,
    closed: AtomicBool,
}

impl MemoryHandle {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::ConnectionError("handle closed".to_string()))
        } else {
            Ok(())
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreHandle for MemoryHandle {
    async fn ping(&self) -> Result<()> {
        self.check_open()
    }

    async fn ensure_collection(&self, collection: &str) -> Result<()> {
        self.check_open()?;
        validate_identifier(collection)?;
        self.state.write().entry(collection.to_string()).or_default();
        Ok(())
    }

    async fn insert_many(&self, collection: &str, docs: &[Document]) -> Result<u64> {
        self.ensure_collection(collection).await?;
        let mut collections = self.state.write();
        let target = collections.entry(collection.to_string()).or_default();
        for doc in docs {
            let mut doc = doc.clone();
            let id = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            doc.insert("_id".to_string(), Value::from(id));
            target.push(doc);
        }
        Ok(docs.len() as u64)
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>> {
        self.check_open()?;
        validate_identifier(collection)?;
        let matched: Vec<Document> = self
            .state
            .read()
            .get(collection)
            .map(|docs| docs.iter().filter(|d| filter.matches(d)).cloned().collect())
            .unwrap_or_default();
        Ok(options.apply(matched))
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        scope: Scope,
    ) -> Result<u64> {
        self.ensure_collection(collection).await?;
        let mut collections = self.state.write();
        let target = collections.entry(collection.to_string()).or_default();

        let mut matched = 0u64;
        let mut modified = 0u64;
        for doc in target.iter_mut().filter(|d| filter.matches(d)) {
            matched += 1;
            if update.apply_to(doc) {
                modified += 1;
            }
            if scope == Scope::One {
                break;
            }
        }

        if matched == 0 && update.upsert {
            let mut doc = filter.equality_document();
            update.apply_to(&mut doc);
            let id = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            doc.insert("_id".to_string(), Value::from(id));
            target.push(doc);
        }
        Ok(modified)
    }

    async fn delete(&self, collection: &str, filter: &Filter, scope: Scope) -> Result<u64> {
        self.check_open()?;
        validate_identifier(collection)?;
        let mut collections = self.state.write();
        let Some(target) = collections.get_mut(collection) else {
            return Ok(0);
        };

        let before = target.len();
        match scope {
            Scope::Many => target.retain(|d| !filter.matches(d)),
            Scope::One => {
                if let Some(pos) = target.iter().position(|d| filter.matches(d)) {
                    target.remove(pos);
                }
            }
        }
        Ok((before - target.len()) as u64)
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        self.check_open()?;
        validate_identifier(collection)?;
        Ok(self
            .state
            .read()
            .get(collection)
            .map(|docs| docs.iter().filter(|d| filter.matches(d)).count() as u64)
            .unwrap_or(0))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
