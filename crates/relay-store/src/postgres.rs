//! Postgres-backed store.

use crate::account::AccountId;
use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::ports::{Store, StoreTransaction};
use crate::query::{QueryResult, Row, SqlParam, SqlQuery};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Executor, Postgres, Row as _, TypeInfo};
use std::sync::Arc;
use tracing::{debug, info};

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// Store backed by a `sqlx` Postgres pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    account_setting: Arc<str>,
}

impl PgStore {
    /// Open a pool from configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let search_path = config.search_path.clone();
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .after_connect(move |conn, _meta| {
                let search_path = search_path.clone();
                Box::pin(async move {
                    if let Some(path) = search_path {
                        let statement = format!("SET search_path TO {path}");
                        conn.execute(statement.as_str()).await?;
                    }
                    Ok(())
                })
            })
            .connect(&config.url)
            .await?;

        info!(
            max_connections = config.max_connections,
            search_path = ?config.search_path,
            "Database pool ready"
        );
        Ok(Self::from_pool(pool, &config.account_setting))
    }

    pub fn from_pool(pool: PgPool, account_setting: &str) -> Self {
        Self {
            pool,
            account_setting: Arc::from(account_setting),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction {
            tx,
            account_setting: self.account_setting.clone(),
        }))
    }
}

struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
    account_setting: Arc<str>,
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn query(&mut self, query: &SqlQuery) -> Result<QueryResult, StoreError> {
        let statement = query
            .params()
            .iter()
            .fold(sqlx::query::<Postgres>(query.text()), bind_param);
        let rows = statement.fetch_all(&mut *self.tx).await?;
        let rows = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
        Ok(QueryResult::new(rows))
    }

    async fn scope_to_account(&mut self, account: AccountId) -> Result<(), StoreError> {
        // Bound as a parameter, never spliced into the statement text.
        // `is_local = true` keeps the value from leaking past this transaction.
        sqlx::query("SELECT set_config($1, $2, true)")
            .bind(self.account_setting.to_string())
            .bind(account.get().to_string())
            .execute(&mut *self.tx)
            .await?;
        debug!(%account, "Transaction scoped to account");
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(Into::into)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| StoreError::Rollback(e.to_string()))
    }
}

fn bind_param<'q>(query: PgQuery<'q>, param: &SqlParam) -> PgQuery<'q> {
    match param {
        SqlParam::Null => query.bind(Option::<String>::None),
        SqlParam::Bool(v) => query.bind(*v),
        SqlParam::Int(v) => query.bind(*v),
        SqlParam::Float(v) => query.bind(*v),
        SqlParam::Text(v) => query.bind(v.clone()),
        SqlParam::Json(v) => query.bind(sqlx::types::Json(v.clone())),
    }
}

fn decode_row(row: &PgRow) -> Result<Row, StoreError> {
    let mut out = Row::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let value = match column.type_info().name() {
            "BOOL" => Value::from(row.try_get::<Option<bool>, _>(idx)?),
            "INT2" => Value::from(row.try_get::<Option<i16>, _>(idx)?),
            "INT4" => Value::from(row.try_get::<Option<i32>, _>(idx)?),
            "INT8" => Value::from(row.try_get::<Option<i64>, _>(idx)?),
            "FLOAT4" => Value::from(row.try_get::<Option<f32>, _>(idx)?),
            "FLOAT8" => Value::from(row.try_get::<Option<f64>, _>(idx)?),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
                Value::from(row.try_get::<Option<String>, _>(idx)?)
            }
            "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(idx)?.unwrap_or(Value::Null),
            "TIMESTAMPTZ" => Value::from(
                row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx)?
                    .map(|ts| ts.to_rfc3339()),
            ),
            "TIMESTAMP" => Value::from(
                row.try_get::<Option<chrono::NaiveDateTime>, _>(idx)?
                    .map(|ts| ts.to_string()),
            ),
            "DATE" => Value::from(
                row.try_get::<Option<chrono::NaiveDate>, _>(idx)?
                    .map(|d| d.to_string()),
            ),
            other => {
                return Err(StoreError::Decode(format!(
                    "unsupported column type {other} for `{}`",
                    column.name()
                )))
            }
        };
        out.insert(column.name(), value);
    }
    Ok(out)
}
