//! 컬렉션 단위 스토어 커넥터.
//!
//! 로더 하나당 하나씩 만들어지며 기본 컬렉션에 묶입니다. 모든 작업은
//! "핸들 획득 + 실행"을 한 단위로 [`RetryPolicy`]에 감싸 실행하므로, 일시적
//! 연결 오류가 나면 캐시된 핸들을 버리고 팩토리에서 새 핸들을 받아 다시
//! 시도합니다.

use crate::document::{validate_identifier, Document, Filter, FindOptions, Update};
use crate::driver::{Scope, StoreHandle};
use crate::error::Result;
use crate::factory::{ConnectionFactory, ConnectionHandle};
use crate::retry::RetryPolicy;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// 특정 컬렉션에 바인딩된 핸들.
#[derive(Debug, Clone)]
pub struct CollectionRef {
    handle: ConnectionHandle,
    name: String,
}

impl CollectionRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn store(&self) -> &Arc<dyn StoreHandle> {
        self.handle.store()
    }
}

/// 재시도와 헬스 체크가 적용된 컬렉션 커넥터.
pub struct StoreConnector {
    factory: Arc<ConnectionFactory>,
    collection: String,
    policy: RetryPolicy,
    /// 인스턴스별 캐시 핸들. 첫 작업 전까지는 비어 있음
    handle: Mutex<Option<ConnectionHandle>>,
}

impl StoreConnector {
    /// 커넥터 생성. 연결은 첫 작업 때 획득합니다.
    ///
    /// 재시도 정책은 팩토리 설정의 `retry`를 따릅니다.
    pub fn new(factory: Arc<ConnectionFactory>, collection: impl Into<String>) -> Result<Self> {
        let collection = collection.into();
        validate_identifier(&collection)?;
        let policy = factory.config().retry.clone();
        Ok(Self {
            factory,
            collection,
            policy,
            handle: Mutex::new(None),
        })
    }

    /// 재시도 정책 교체.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn factory(&self) -> &Arc<ConnectionFactory> {
        &self.factory
    }

    /// 현재 캐시된 핸들의 세대 번호 (아직 획득 전이면 `None`).
    pub fn cached_generation(&self) -> Option<u64> {
        self.slot().as_ref().map(|h| h.generation())
    }

    /// 건강한 핸들을 미리 확보하고 기본 컬렉션을 준비합니다.
    pub async fn ensure_connected(&self) -> Result<()> {
        self.get_collection(None).await.map(|_| ())
    }

    /// 컬렉션 핸들을 반환합니다 (`None`이면 기본 컬렉션).
    pub async fn get_collection(&self, name: Option<&str>) -> Result<CollectionRef> {
        let name = validate_identifier(name.unwrap_or(&self.collection))?.to_string();
        let this = self;
        let target = name.as_str();
        self.policy
            .with_retry(
                "get_collection",
                || this.invalidate(),
                move || async move {
                    let handle = this.acquire().await?;
                    handle.store().ensure_collection(target).await?;
                    Ok(CollectionRef {
                        handle,
                        name: target.to_string(),
                    })
                },
            )
            .await
    }

    pub async fn insert_one(&self, doc: Document) -> Result<u64> {
        self.insert_many(std::slice::from_ref(&doc)).await
    }

    /// 문서를 삽입하고 삽입 개수를 반환합니다. 빈 입력은 스토어에 접근하지 않습니다.
    pub async fn insert_many(&self, docs: &[Document]) -> Result<u64> {
        if docs.is_empty() {
            return Ok(0);
        }
        let this = self;
        self.policy
            .with_retry("insert_many", || this.invalidate(), move || async move {
                let handle = this.acquire().await?;
                handle.store().insert_many(&this.collection, docs).await
            })
            .await
    }

    pub async fn find(&self, filter: &Filter, options: &FindOptions) -> Result<Vec<Document>> {
        let this = self;
        self.policy
            .with_retry("find", || this.invalidate(), move || async move {
                let handle = this.acquire().await?;
                handle.store().find(&this.collection, filter, options).await
            })
            .await
    }

    /// 옵션의 정렬을 따른 첫 문서.
    pub async fn find_one(
        &self,
        filter: &Filter,
        options: FindOptions,
    ) -> Result<Option<Document>> {
        let options = options.limit(1);
        let docs = self.find(filter, &options).await?;
        Ok(docs.into_iter().next())
    }

    pub async fn update_one(&self, filter: &Filter, update: &Update) -> Result<u64> {
        self.update(filter, update, Scope::One, "update_one").await
    }

    pub async fn update_many(&self, filter: &Filter, update: &Update) -> Result<u64> {
        self.update(filter, update, Scope::Many, "update_many").await
    }

    pub async fn delete_one(&self, filter: &Filter) -> Result<u64> {
        self.delete(filter, Scope::One, "delete_one").await
    }

    pub async fn delete_many(&self, filter: &Filter) -> Result<u64> {
        self.delete(filter, Scope::Many, "delete_many").await
    }

    pub async fn count(&self, filter: &Filter) -> Result<u64> {
        let this = self;
        self.policy
            .with_retry("count", || this.invalidate(), move || async move {
                let handle = this.acquire().await?;
                handle.store().count(&this.collection, filter).await
            })
            .await
    }

    async fn update(
        &self,
        filter: &Filter,
        update: &Update,
        scope: Scope,
        op_name: &str,
    ) -> Result<u64> {
        let this = self;
        self.policy
            .with_retry(op_name, || this.invalidate(), move || async move {
                let handle = this.acquire().await?;
                handle
                    .store()
                    .update(&this.collection, filter, update, scope)
                    .await
            })
            .await
    }

    async fn delete(&self, filter: &Filter, scope: Scope, op_name: &str) -> Result<u64> {
        let this = self;
        self.policy
            .with_retry(op_name, || this.invalidate(), move || async move {
                let handle = this.acquire().await?;
                handle.store().delete(&this.collection, filter, scope).await
            })
            .await
    }

    /// 캐시 핸들을 재검증하고, 실패하면 팩토리에서 다시 받습니다.
    async fn acquire(&self) -> Result<ConnectionHandle> {
        let cached = self.slot().clone();
        if let Some(handle) = cached {
            if !handle.is_expired() && self.factory.check_health(&handle).await {
                return Ok(handle);
            }
            debug!(
                collection = %self.collection,
                generation = handle.generation(),
                "Cached handle failed validation, re-acquiring"
            );
        }

        let handle = self
            .factory
            .get_handle(self.factory.config().max_retry_window())
            .await?;
        *self.slot() = Some(handle.clone());
        Ok(handle)
    }

    fn invalidate(&self) {
        if let Some(old) = self.slot().take() {
            debug!(
                collection = %self.collection,
                generation = old.generation(),
                "Dropped cached handle after connection error"
            );
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<ConnectionHandle>> {
        self.handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
