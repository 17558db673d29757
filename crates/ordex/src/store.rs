//! Store (C9, §4.9). The single persistence boundary every higher layer speaks through.
//! `Store` is a trait so the orchestrator never cares whether it is talking to Postgres
//! or to a process-local stand-in; `MemoryStore` backs dry-run mode (§4.9 "the store's
//! absence is permitted") and unit tests, `PostgresStore` is the real thing, grounded on
//! the schema in §6 and on `yonasBSD-readur`'s runtime `sqlx::query`/`query_as` style
//! (no compile-time `query!` macros, since this workspace doesn't ship a `DATABASE_URL`
//! at build time).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::domain::{
    truncate_log_message, Assignment, LogLevel, Order, OrderStatus, OrderType, ProcessingLog, Stage,
};

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_or_create_order(
        &self,
        source_code: &str,
        order_number: &str,
        order_date: Option<chrono::NaiveDate>,
        order_type: OrderType,
        title: Option<&str>,
        source_url: Option<&str>,
        file_url: Option<&str>,
    ) -> anyhow::Result<Uuid>;

    async fn get_order(&self, order_id: Uuid) -> anyhow::Result<Option<Order>>;

    #[allow(clippy::too_many_arguments)]
    async fn update_order_status(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        file_hash: Option<&str>,
        page_count: Option<i32>,
        ocr_method: Option<&str>,
        ocr_confidence: Option<f64>,
        error_message: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Transactional (§4.9): delete all assignments owned by the order, then insert the
    /// new set. Either all succeed or none do.
    async fn save_assignments(&self, order_id: Uuid, records: &[Assignment]) -> anyhow::Result<()>;

    /// Best-effort (§4.9, §7): a logging failure must never cascade into a pipeline
    /// failure, so implementations swallow their own errors and log locally instead of
    /// propagating.
    async fn log_processing(
        &self,
        order_id: Option<Uuid>,
        source_code: Option<&str>,
        level: LogLevel,
        stage: Stage,
        message: &str,
        details: Option<Value>,
    );

    async fn get_pending_orders(&self, limit: i64) -> anyhow::Result<Vec<Order>>;

    async fn check_file_exists(&self, file_hash: &str) -> anyhow::Result<Option<Uuid>>;

    /// The set of `source_url`/`file_url` values already on file for this source, used
    /// by the change detector's dedup step (§4.8 step 6).
    async fn known_order_urls(&self, source_code: &str) -> anyhow::Result<std::collections::HashSet<String>>;

    /// Persists the change detector's runtime checkpoint fields (§3 "mutable runtime
    /// fields"): `last_content_hash`, `last_etag`, `last_checked_at`.
    async fn update_source_checkpoint(
        &self,
        source_code: &str,
        content_hash: &str,
        etag: Option<&str>,
    ) -> anyhow::Result<()>;

    /// The previously recorded content hash for this source, if any (§4.8 step 6 diff
    /// target for the `UNCHANGED`/`CHANGED` distinction).
    async fn last_content_hash(&self, source_code: &str) -> anyhow::Result<Option<String>>;
}

/// In-process stand-in for the store: dry-run mode when no `DATABASE_URL` is configured
/// (§4.9), and the backing for unit tests that don't want a live Postgres. Writes are
/// real within the process — just not durable across runs.
#[derive(Default)]
pub struct MemoryStore {
    orders: Mutex<HashMap<Uuid, Order>>,
    assignments: Mutex<HashMap<Uuid, Vec<Assignment>>>,
    logs: Mutex<Vec<ProcessingLog>>,
    source_checkpoints: Mutex<HashMap<String, (String, Option<String>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_or_create_order(
        &self,
        source_code: &str,
        order_number: &str,
        order_date: Option<chrono::NaiveDate>,
        order_type: OrderType,
        title: Option<&str>,
        source_url: Option<&str>,
        file_url: Option<&str>,
    ) -> anyhow::Result<Uuid> {
        let mut orders = self.orders.lock().expect("orders lock poisoned");
        if let Some(existing) = orders.values().find(|o| {
            o.source_code == source_code && o.order_number == order_number && o.order_date == order_date
        }) {
            return Ok(existing.id);
        }

        let id = Uuid::new_v4();
        orders.insert(
            id,
            Order {
                id,
                source_code: source_code.to_string(),
                order_number: order_number.to_string(),
                order_date,
                order_type,
                title: title.map(str::to_string),
                source_url: source_url.map(str::to_string),
                file_url: file_url.map(str::to_string),
                file_hash: None,
                status: OrderStatus::New,
                page_count: None,
                ocr_method: None,
                ocr_confidence: None,
                error_message: None,
                created_at: Utc::now().naive_utc(),
                extracted_at: None,
            },
        );
        Ok(id)
    }

    async fn get_order(&self, order_id: Uuid) -> anyhow::Result<Option<Order>> {
        Ok(self.orders.lock().expect("orders lock poisoned").get(&order_id).cloned())
    }

    async fn update_order_status(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        file_hash: Option<&str>,
        page_count: Option<i32>,
        ocr_method: Option<&str>,
        ocr_confidence: Option<f64>,
        error_message: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut orders = self.orders.lock().expect("orders lock poisoned");
        let order = orders
            .get_mut(&order_id)
            .ok_or_else(|| anyhow::anyhow!("order {order_id} not found"))?;
        order.status = status;
        if let Some(h) = file_hash {
            order.file_hash = Some(h.to_string());
        }
        if let Some(p) = page_count {
            order.page_count = Some(p);
        }
        if let Some(m) = ocr_method {
            order.ocr_method = Some(m.to_string());
        }
        if let Some(c) = ocr_confidence {
            order.ocr_confidence = Some(c);
        }
        if let Some(e) = error_message {
            order.error_message = Some(e.to_string());
        }
        if matches!(status, OrderStatus::Extracted) {
            order.extracted_at = Some(Utc::now().naive_utc());
        }
        Ok(())
    }

    async fn save_assignments(&self, order_id: Uuid, records: &[Assignment]) -> anyhow::Result<()> {
        for record in records {
            record.validate()?;
        }
        let mut assignments = self.assignments.lock().expect("assignments lock poisoned");
        assignments.insert(order_id, records.to_vec());
        Ok(())
    }

    async fn log_processing(
        &self,
        order_id: Option<Uuid>,
        source_code: Option<&str>,
        level: LogLevel,
        stage: Stage,
        message: &str,
        details: Option<Value>,
    ) {
        let entry = ProcessingLog {
            id: Uuid::new_v4(),
            source_code: source_code.map(str::to_string),
            order_id,
            level,
            stage,
            message: truncate_log_message(message),
            details,
            created_at: Utc::now().naive_utc(),
        };
        match self.logs.lock() {
            Ok(mut logs) => logs.push(entry),
            Err(e) => tracing::error!(error = %e, "processing log mutex poisoned, dropping entry"),
        }
    }

    async fn get_pending_orders(&self, limit: i64) -> anyhow::Result<Vec<Order>> {
        let orders = self.orders.lock().expect("orders lock poisoned");
        let mut pending: Vec<Order> = orders
            .values()
            .filter(|o| matches!(o.status, OrderStatus::New | OrderStatus::Downloaded))
            .cloned()
            .collect();
        pending.sort_by_key(|o| o.created_at);
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn check_file_exists(&self, file_hash: &str) -> anyhow::Result<Option<Uuid>> {
        let orders = self.orders.lock().expect("orders lock poisoned");
        Ok(orders
            .values()
            .find(|o| o.file_hash.as_deref() == Some(file_hash))
            .map(|o| o.id))
    }

    async fn known_order_urls(&self, source_code: &str) -> anyhow::Result<std::collections::HashSet<String>> {
        let orders = self.orders.lock().expect("orders lock poisoned");
        let mut urls = std::collections::HashSet::new();
        for o in orders.values().filter(|o| o.source_code == source_code) {
            if let Some(u) = &o.source_url {
                urls.insert(u.clone());
            }
            if let Some(u) = &o.file_url {
                urls.insert(u.clone());
            }
        }
        Ok(urls)
    }

    async fn update_source_checkpoint(
        &self,
        source_code: &str,
        content_hash: &str,
        etag: Option<&str>,
    ) -> anyhow::Result<()> {
        self.source_checkpoints
            .lock()
            .expect("source_checkpoints lock poisoned")
            .insert(source_code.to_string(), (content_hash.to_string(), etag.map(str::to_string)));
        Ok(())
    }

    async fn last_content_hash(&self, source_code: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .source_checkpoints
            .lock()
            .expect("source_checkpoints lock poisoned")
            .get(source_code)
            .map(|(hash, _)| hash.clone()))
    }
}

#[cfg(feature = "postgres-store")]
pub mod postgres {
    use super::*;
    use sqlx::Row;
    use sqlx::postgres::PgPoolOptions;
    use sqlx::PgPool;
    use std::str::FromStr;

    /// Real Postgres-backed `Store`, grounded on the schema in §6. Uses runtime
    /// `sqlx::query`/`query_as` (the `readur`-style binding, not compile-time `query!`
    /// macros) so the crate builds without a live database at compile time.
    pub struct PostgresStore {
        pool: PgPool,
    }

    impl PostgresStore {
        pub async fn connect(database_url: &str, min: u32, max: u32) -> anyhow::Result<Self> {
            let pool = PgPoolOptions::new()
                .min_connections(min)
                .max_connections(max)
                .connect(database_url)
                .await?;
            Ok(Self { pool })
        }

        fn row_to_order(row: &sqlx::postgres::PgRow) -> anyhow::Result<Order> {
            let status: String = row.try_get("status")?;
            let order_type: String = row.try_get("order_type")?;
            Ok(Order {
                id: row.try_get("id")?,
                source_code: row.try_get("source_code")?,
                order_number: row.try_get("order_number")?,
                order_date: row.try_get("order_date")?,
                order_type: order_type.parse().unwrap_or(OrderType::Order),
                title: row.try_get("title")?,
                source_url: row.try_get("source_url")?,
                file_url: row.try_get("file_url")?,
                file_hash: row.try_get("file_hash")?,
                status: status.parse().unwrap_or(OrderStatus::Failed),
                page_count: row.try_get("page_count")?,
                ocr_method: row.try_get("ocr_method")?,
                ocr_confidence: row.try_get("ocr_confidence")?,
                error_message: row.try_get("error_message")?,
                created_at: row.try_get("created_at")?,
                extracted_at: row.try_get("extracted_at")?,
            })
        }
    }

    #[async_trait]
    impl Store for PostgresStore {
        async fn get_or_create_order(
            &self,
            source_code: &str,
            order_number: &str,
            order_date: Option<chrono::NaiveDate>,
            order_type: OrderType,
            title: Option<&str>,
            source_url: Option<&str>,
            file_url: Option<&str>,
        ) -> anyhow::Result<Uuid> {
            if let Some(row) = sqlx::query(
                "SELECT o.id FROM orders o JOIN registry_sources s ON s.id = o.source_id \
                 WHERE s.code = $1 AND o.order_number = $2 AND o.order_date IS NOT DISTINCT FROM $3",
            )
            .bind(source_code)
            .bind(order_number)
            .bind(order_date)
            .fetch_optional(&self.pool)
            .await?
            {
                return Ok(row.try_get("id")?);
            }

            let row = sqlx::query(
                "INSERT INTO orders (id, source_id, order_number, order_date, order_type, title, \
                 source_url, file_url, status, created_at) \
                 SELECT $1, s.id, $2, $3, $4, $5, $6, $7, 'new', now() FROM registry_sources s WHERE s.code = $8 \
                 RETURNING id",
            )
            .bind(Uuid::new_v4())
            .bind(order_number)
            .bind(order_date)
            .bind(order_type.to_string())
            .bind(title)
            .bind(source_url)
            .bind(file_url)
            .bind(source_code)
            .fetch_one(&self.pool)
            .await?;
            Ok(row.try_get("id")?)
        }

        async fn get_order(&self, order_id: Uuid) -> anyhow::Result<Option<Order>> {
            let row = sqlx::query(
                "SELECT o.*, s.code AS source_code FROM orders o \
                 JOIN registry_sources s ON s.id = o.source_id WHERE o.id = $1",
            )
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
            row.as_ref().map(Self::row_to_order).transpose()
        }

        async fn update_order_status(
            &self,
            order_id: Uuid,
            status: OrderStatus,
            file_hash: Option<&str>,
            page_count: Option<i32>,
            ocr_method: Option<&str>,
            ocr_confidence: Option<f64>,
            error_message: Option<&str>,
        ) -> anyhow::Result<()> {
            let extracted_at = matches!(status, OrderStatus::Extracted).then(chrono::Utc::now);
            sqlx::query(
                "UPDATE orders SET status = $1, \
                 file_hash = COALESCE($2, file_hash), \
                 page_count = COALESCE($3, page_count), \
                 ocr_method = COALESCE($4, ocr_method), \
                 ocr_confidence = COALESCE($5, ocr_confidence), \
                 error_message = COALESCE($6, error_message), \
                 extracted_at = COALESCE($7, extracted_at) \
                 WHERE id = $8",
            )
            .bind(status.to_string())
            .bind(file_hash)
            .bind(page_count)
            .bind(ocr_method)
            .bind(ocr_confidence)
            .bind(error_message)
            .bind(extracted_at.map(|t| t.naive_utc()))
            .bind(order_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn save_assignments(&self, order_id: Uuid, records: &[Assignment]) -> anyhow::Result<()> {
            for record in records {
                record.validate()?;
            }

            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM assignments WHERE order_id = $1")
                .bind(order_id)
                .execute(&mut *tx)
                .await?;

            for record in records {
                let extras = serde_json::to_value(&record.extras)?;
                let outcome = sqlx::query(
                    "INSERT INTO assignments \
                     (id, order_id, fio, birth_date_raw, ias_id, submission_number, assignment_type, \
                      rank_category, sport, sport_original, sport_id, action, extra_fields, \
                      llm_model, confidence, created_at) \
                     VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15, now())",
                )
                .bind(Uuid::new_v4())
                .bind(order_id)
                .bind(&record.fio)
                .bind(&record.birth_date)
                .bind(record.ias_id)
                .bind(&record.submission_number)
                .bind(record.assignment_kind.to_string())
                .bind(&record.rank_category)
                .bind(&record.sport)
                .bind(&record.sport_original)
                .bind(record.sport_id)
                .bind(record.action.to_string())
                .bind(extras)
                .bind(&record.extractor_tag)
                .bind(record.confidence)
                .execute(&mut *tx)
                .await;

                if let Err(e) = outcome {
                    tracing::warn!(fio = %record.fio, error = %e, "skipping assignment record that failed to insert");
                }
            }

            tx.commit().await?;
            Ok(())
        }

        async fn log_processing(
            &self,
            order_id: Option<Uuid>,
            source_code: Option<&str>,
            level: LogLevel,
            stage: Stage,
            message: &str,
            details: Option<Value>,
        ) {
            let message = truncate_log_message(message);
            let source_id: Option<Uuid> = match source_code {
                Some(code) => sqlx::query("SELECT id FROM registry_sources WHERE code = $1")
                    .bind(code)
                    .fetch_optional(&self.pool)
                    .await
                    .ok()
                    .flatten()
                    .and_then(|r| r.try_get("id").ok()),
                None => None,
            };

            let result = sqlx::query(
                "INSERT INTO processing_log (id, order_id, source_id, level, stage, message, details, created_at) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7, now())",
            )
            .bind(Uuid::new_v4())
            .bind(order_id)
            .bind(source_id)
            .bind(level.to_string())
            .bind(stage.to_string())
            .bind(&message)
            .bind(details)
            .execute(&self.pool)
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, stage = %stage, "failed to persist processing log entry, logging locally only");
            }
        }

        async fn get_pending_orders(&self, limit: i64) -> anyhow::Result<Vec<Order>> {
            let rows = sqlx::query(
                "SELECT o.*, s.code AS source_code FROM orders o \
                 JOIN registry_sources s ON s.id = o.source_id \
                 WHERE o.status IN ('new', 'downloaded') \
                 ORDER BY o.created_at ASC LIMIT $1",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(Self::row_to_order).collect()
        }

        async fn check_file_exists(&self, file_hash: &str) -> anyhow::Result<Option<Uuid>> {
            let row = sqlx::query("SELECT id FROM orders WHERE file_hash = $1")
                .bind(file_hash)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row.map(|r| r.try_get("id")).transpose()?)
        }

        async fn known_order_urls(&self, source_code: &str) -> anyhow::Result<std::collections::HashSet<String>> {
            let rows = sqlx::query(
                "SELECT o.source_url, o.file_url FROM orders o \
                 JOIN registry_sources s ON s.id = o.source_id WHERE s.code = $1",
            )
            .bind(source_code)
            .fetch_all(&self.pool)
            .await?;
            let mut urls = std::collections::HashSet::new();
            for row in rows {
                if let Some(u) = row.try_get::<Option<String>, _>("source_url")? {
                    urls.insert(u);
                }
                if let Some(u) = row.try_get::<Option<String>, _>("file_url")? {
                    urls.insert(u);
                }
            }
            Ok(urls)
        }

        async fn update_source_checkpoint(
            &self,
            source_code: &str,
            content_hash: &str,
            etag: Option<&str>,
        ) -> anyhow::Result<()> {
            sqlx::query(
                "UPDATE registry_sources SET last_page_hash = $1, last_etag = $2, last_checked_at = now() \
                 WHERE code = $3",
            )
            .bind(content_hash)
            .bind(etag)
            .bind(source_code)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn last_content_hash(&self, source_code: &str) -> anyhow::Result<Option<String>> {
            let row = sqlx::query("SELECT last_page_hash FROM registry_sources WHERE code = $1")
                .bind(source_code)
                .fetch_optional(&self.pool)
                .await?;
            row.map(|r| r.try_get::<Option<String>, _>("last_page_hash").map_err(anyhow::Error::from))
                .transpose()
                .map(Option::flatten)
        }
    }

    #[allow(dead_code)]
    fn _assert_fromstr<T: FromStr>() {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_order_is_idempotent_on_source_number_date() {
        let store = MemoryStore::new();
        let date = chrono::NaiveDate::from_ymd_opt(2024, 3, 1);
        let id1 = store
            .get_or_create_order("spb_kfkis", "123", date, OrderType::Order, None, None, None)
            .await
            .unwrap();
        let id2 = store
            .get_or_create_order("spb_kfkis", "123", date, OrderType::Order, None, None, None)
            .await
            .unwrap();
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn check_file_exists_finds_order_by_hash() {
        let store = MemoryStore::new();
        let id = store
            .get_or_create_order("spb_kfkis", "1", None, OrderType::Order, None, None, None)
            .await
            .unwrap();
        store
            .update_order_status(id, OrderStatus::Downloaded, Some("abc123"), None, None, None, None)
            .await
            .unwrap();
        assert_eq!(store.check_file_exists("abc123").await.unwrap(), Some(id));
        assert_eq!(store.check_file_exists("zzz").await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_pending_orders_returns_new_and_downloaded_oldest_first() {
        let store = MemoryStore::new();
        let id1 = store
            .get_or_create_order("a", "1", None, OrderType::Order, None, None, None)
            .await
            .unwrap();
        let id2 = store
            .get_or_create_order("a", "2", None, OrderType::Order, None, None, None)
            .await
            .unwrap();
        store
            .update_order_status(id2, OrderStatus::Downloaded, None, None, None, None, None)
            .await
            .unwrap();
        let pending = store.get_pending_orders(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, id1);
    }
}
