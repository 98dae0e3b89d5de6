//! PostgreSQL(JSONB) 스토어 드라이버.
//!
//! 컬렉션 하나가 `DATABASE_NAME` 스키마 아래의 테이블 하나에 대응합니다.
//!
//! ```text
//! "<schema>"."<collection>" (id BIGSERIAL PRIMARY KEY, doc JSONB NOT NULL)
//! ```
//!
//! - 등호 조건: `doc @> $json`
//! - 시간 구간: `(doc->>$field)::timestamptz`
//! - 정렬: `doc->>$field` (고정 폭 시각 문자열이므로 시간 순서와 같음)

use super::{Scope, StoreDriver, StoreHandle};
use crate::config::StoreConfig;
use crate::document::{validate_identifier, Condition, Document, Filter, FindOptions, SortOrder, Update};
use crate::error::{Result, StoreError};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use std::collections::HashSet;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// 한 번의 INSERT 문에 담는 최대 문서 수
const INSERT_CHUNK: usize = 500;

/// PostgreSQL 드라이버.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDriver;

#[async_trait]
impl StoreDriver for PostgresDriver {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn connect(&self, config: &StoreConfig) -> Result<Arc<dyn StoreHandle>> {
        let (uri, database_name) = config.require_target()?;
        let schema = validate_identifier(database_name)?.to_string();

        info!(app_name = %config.app_name, schema = %schema, "Connecting to store...");

        let options = PgConnectOptions::from_str(uri)?.application_name(&config.app_name);
        let connecting = PgPoolOptions::new()
            .max_connections(config.max_pool_size.max(1))
            .min_connections(config.min_pool_size)
            .acquire_timeout(config.select_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect_with(options);

        let pool = tokio::time::timeout(config.connect_timeout(), connecting)
            .await
            .map_err(|_| {
                StoreError::Timeout(format!(
                    "connect timed out after {}ms",
                    config.connect_timeout_ms
                ))
            })??;

        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{schema}\""))
            .execute(&pool)
            .await?;

        info!("Store connection established");

        Ok(Arc::new(PostgresHandle {
            pool,
            schema,
            socket_timeout: config.socket_timeout(),
            ensured: Mutex::new(HashSet::new()),
        }))
    }
}

/// PostgreSQL 연결 풀 래퍼.
pub struct PostgresHandle {
    pool: PgPool,
    schema: String,
    socket_timeout: Duration,
    ensured: Mutex<HashSet<String>>,
}

impl PostgresHandle {
    /// 내부 연결 풀을 반환합니다.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn table(&self, collection: &str) -> Result<String> {
        let collection = validate_identifier(collection)?;
        Ok(format!("\"{}\".\"{}\"", self.schema, collection))
    }

    fn is_ensured(&self, collection: &str) -> bool {
        self.ensured
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(collection)
    }

    /// 소켓 타임아웃을 적용해 작업을 실행합니다.
    async fn timed<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.socket_timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(format!(
                "socket timeout after {}ms",
                self.socket_timeout.as_millis()
            ))),
        }
    }

    /// 준비된 테이블 이름을 반환합니다 (필요하면 생성).
    async fn prepared_table(&self, collection: &str) -> Result<String> {
        self.ensure_collection(collection).await?;
        self.table(collection)
    }
}

/// WHERE 절을 조립합니다.
fn push_where(builder: &mut QueryBuilder<'_, Postgres>, filter: &Filter) {
    builder.push(" WHERE TRUE");

    let equality = filter.equality_document();
    if !equality.is_empty() {
        builder.push(" AND doc @> ");
        builder.push_bind(Json(Value::Object(equality)));
        builder.push("::jsonb");
    }

    for (field, condition) in filter.conditions() {
        if let Condition::TimeRange { gte, lt } = condition {
            if let Some(start) = gte {
                builder.push(" AND (doc->>");
                builder.push_bind(field.clone());
                builder.push(")::timestamptz >= ");
                builder.push_bind(*start);
            }
            if let Some(end) = lt {
                builder.push(" AND (doc->>");
                builder.push_bind(field.clone());
                builder.push(")::timestamptz < ");
                builder.push_bind(*end);
            }
        }
    }
}

/// 단건 대상일 때 `id = (SELECT ... LIMIT 1)` 형태로 범위를 좁힙니다.
fn push_scoped_where(builder: &mut QueryBuilder<'_, Postgres>, table: &str, filter: &Filter, scope: Scope) {
    match scope {
        Scope::Many => push_where(builder, filter),
        Scope::One => {
            builder.push(format!(" WHERE id = (SELECT id FROM {table}"));
            push_where(builder, filter);
            builder.push(" ORDER BY id LIMIT 1)");
        }
    }
}

fn without_store_id(doc: &Document) -> Document {
    doc.iter()
        .filter(|(k, _)| k.as_str() != "_id")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[async_trait]
impl StoreHandle for PostgresHandle {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn ensure_collection(&self, collection: &str) -> Result<()> {
        if self.is_ensured(collection) {
            return Ok(());
        }
        let table = self.table(collection)?;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (id BIGSERIAL PRIMARY KEY, doc JSONB NOT NULL)"
        );
        self.timed(sqlx::query(&ddl).execute(&self.pool)).await?;

        let index = format!(
            "CREATE INDEX IF NOT EXISTS \"{collection}_doc_idx\" ON {table} USING GIN (doc jsonb_path_ops)"
        );
        self.timed(sqlx::query(&index).execute(&self.pool)).await?;

        self.ensured
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(collection.to_string());
        debug!(collection = collection, "Collection ready");
        Ok(())
    }

    #[instrument(skip(self, docs), fields(count = docs.len()))]
    async fn insert_many(&self, collection: &str, docs: &[Document]) -> Result<u64> {
        if docs.is_empty() {
            return Ok(0);
        }
        let table = self.prepared_table(collection).await?;
        let owned: Vec<Document> = docs.iter().map(without_store_id).collect();

        let sql = format!("INSERT INTO {table} (doc) SELECT * FROM UNNEST($1::jsonb[])");
        let mut tx = self.timed(self.pool.begin()).await?;
        let mut inserted = 0u64;
        // UNNEST 패턴으로 일괄 삽입
        for chunk in owned.chunks(INSERT_CHUNK) {
            let docs: Vec<Json<&Document>> = chunk.iter().map(Json).collect();
            let result = self
                .timed(sqlx::query(&sql).bind(docs).execute(&mut *tx))
                .await?;
            inserted += result.rows_affected();
        }
        self.timed(tx.commit()).await?;
        Ok(inserted)
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>> {
        let table = self.prepared_table(collection).await?;
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT id, doc FROM {table}"));
        push_where(&mut builder, filter);

        if let Some((field, order)) = &options.sort {
            builder.push(" ORDER BY doc->>");
            builder.push_bind(field.clone());
            builder.push(match order {
                SortOrder::Ascending => " ASC, id ASC",
                SortOrder::Descending => " DESC, id DESC",
            });
        } else {
            builder.push(" ORDER BY id");
        }
        if let Some(limit) = options.limit {
            builder.push(" LIMIT ");
            builder.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows: Vec<(i64, Json<Value>)> = self
            .timed(builder.build_query_as().fetch_all(&self.pool))
            .await?;

        let docs = rows
            .into_iter()
            .filter_map(|(id, Json(value))| match value {
                Value::Object(mut doc) => {
                    doc.insert("_id".to_string(), Value::from(id));
                    Some(doc)
                }
                _ => None,
            })
            .collect();

        let projection = FindOptions {
            projection: options.projection.clone(),
            ..FindOptions::default()
        };
        Ok(projection.apply(docs))
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        scope: Scope,
    ) -> Result<u64> {
        let table = self.prepared_table(collection).await?;

        if update.upsert && self.count(collection, filter).await? == 0 {
            let mut doc = filter.equality_document();
            update.apply_to(&mut doc);
            self.insert_many(collection, &[doc]).await?;
            return Ok(0);
        }

        let set = Value::Object(update.set.clone());
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("UPDATE {table} SET doc = doc || "));
        builder.push_bind(Json(set.clone()));
        builder.push("::jsonb");
        push_scoped_where(&mut builder, &table, filter, scope);
        // 이미 같은 값이면 변경으로 세지 않음
        builder.push(" AND NOT (doc @> ");
        builder.push_bind(Json(set));
        builder.push("::jsonb)");

        let result = self.timed(builder.build().execute(&self.pool)).await?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, collection: &str, filter: &Filter, scope: Scope) -> Result<u64> {
        let table = self.prepared_table(collection).await?;
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("DELETE FROM {table}"));
        push_scoped_where(&mut builder, &table, filter, scope);

        let result = self.timed(builder.build().execute(&self.pool)).await?;
        Ok(result.rows_affected())
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let table = self.prepared_table(collection).await?;
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT COUNT(*) FROM {table}"));
        push_where(&mut builder, filter);

        let (count,): (i64,) = self
            .timed(builder.build_query_as().fetch_one(&self.pool))
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_where_clause_binds_fields() {
        let start = Utc.with_ymd_and_hms(2025, 6, 24, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 6, 25, 0, 0, 0).unwrap();
        let filter = Filter::all()
            .eq("symbol", "BTC")
            .time_range("timestamp", start, end);

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("DELETE FROM \"db\".\"t\"");
        push_where(&mut builder, &filter);
        let sql = builder.sql();

        assert_eq!(
            sql,
            "DELETE FROM \"db\".\"t\" WHERE TRUE AND doc @> $1::jsonb \
             AND (doc->>$2)::timestamptz >= $3 AND (doc->>$4)::timestamptz < $5"
        );
    }

    #[test]
    fn test_single_scope_uses_id_subquery() {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("DELETE FROM t");
        push_scoped_where(&mut builder, "t", &Filter::all().eq("symbol", "ETH"), Scope::One);
        assert_eq!(
            builder.sql(),
            "DELETE FROM t WHERE id = (SELECT id FROM t WHERE TRUE AND doc @> $1::jsonb ORDER BY id LIMIT 1)"
        );
    }
}
