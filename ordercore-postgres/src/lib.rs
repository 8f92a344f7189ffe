//! PostgreSQL adapter for the `OrderCore` engine.
//!
//! Documents live in one table per entity kind, each row carrying the
//! document as JSONB and its version. A commit runs in a transaction that
//! locks every existing row it touches with `SELECT ... FOR UPDATE` and
//! checks the expected version against the locked row. Creating a document
//! that another transaction created first fails on the primary key, which is
//! reported as a version conflict as well.
//!
//! The change feed carries the changes committed through this store and its
//! clones. Changes are published after the transaction commits.

mod schema;

use std::time::Duration;

use async_trait::async_trait;
use nutype::nutype;
use ordercore::errors::{StoreError, StoreResult};
use ordercore::model::{Notification, Order, OrderStatus, Payment, Product, ShippingRecord};
use ordercore::store::{
    Change, ChangeFeed, CommitMode, CommitReceipt, Document, DocumentKey, ExpectedVersion,
    OrderStore, SkippedWrite, Versioned, Write, WriteBatch, DEFAULT_CHANGE_FEED_CAPACITY,
};
use ordercore::types::{DocVersion, OrderId, PaymentId, ProductId};
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgConnection, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{query, Pool, Postgres, Row};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use crate::schema::{
    Table, INSERT_NOTIFICATION, MIGRATIONS, MIGRATION_LOCK, SELECT_NOTIFICATIONS,
    SELECT_ORDERS_WITH_STATUS,
};

/// Failures setting the store up.
#[derive(Debug, Error)]
pub enum PostgresOrderStoreError {
    /// The pool could not connect.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),
    /// A schema statement failed.
    #[error("failed to apply the ordercore schema")]
    MigrationFailed(#[source] sqlx::Error),
}

/// Maximum number of database connections in the pool.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(std::num::NonZeroU32);

/// Connection pool settings.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
    /// Changes buffered per change-feed subscriber before it lags
    pub change_feed_capacity: usize,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: std::num::NonZeroU32 =
            match std::num::NonZeroU32::new(10) {
                Some(v) => v,
                None => unreachable!(),
            };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            change_feed_capacity: DEFAULT_CHANGE_FEED_CAPACITY,
        }
    }
}

/// Order store backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresOrderStore {
    pool: Pool<Postgres>,
    changes: broadcast::Sender<Change>,
}

impl PostgresOrderStore {
    /// Connects with the default configuration.
    pub async fn new<S: Into<String>>(
        connection_string: S,
    ) -> Result<Self, PostgresOrderStoreError> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    /// Connects with a custom configuration.
    pub async fn with_config<S: Into<String>>(
        connection_string: S,
        config: PostgresConfig,
    ) -> Result<Self, PostgresOrderStoreError> {
        let connection_string = connection_string.into();
        let max_connections: std::num::NonZeroU32 = config.max_connections.into();
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.get())
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&connection_string)
            .await
            .map_err(PostgresOrderStoreError::ConnectionFailed)?;
        Ok(Self::from_pool_with_capacity(pool, config.change_feed_capacity))
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self::from_pool_with_capacity(pool, DEFAULT_CHANGE_FEED_CAPACITY)
    }

    fn from_pool_with_capacity(pool: Pool<Postgres>, capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self { pool, changes }
    }

    /// The underlying pool.
    pub const fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Checks that the database answers.
    pub async fn ping(&self) -> StoreResult<()> {
        query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|error| map_sqlx_error(&error, "ping"))
    }

    /// Creates the tables if they do not exist. Safe to run concurrently.
    #[instrument(name = "postgres.migrate", skip(self))]
    pub async fn migrate(&self) -> Result<(), PostgresOrderStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(PostgresOrderStoreError::MigrationFailed)?;
        query("SELECT pg_advisory_xact_lock($1)")
            .bind(MIGRATION_LOCK)
            .execute(&mut *tx)
            .await
            .map_err(PostgresOrderStoreError::MigrationFailed)?;
        for statement in MIGRATIONS {
            query(statement)
                .execute(&mut *tx)
                .await
                .map_err(PostgresOrderStoreError::MigrationFailed)?;
        }
        tx.commit()
            .await
            .map_err(PostgresOrderStoreError::MigrationFailed)?;
        info!(statements = MIGRATIONS.len(), "[postgres.migrate] schema is up to date");
        Ok(())
    }

    async fn read<T: DeserializeOwned + Send + Unpin>(
        &self,
        table: Table,
        id: &str,
        operation: &'static str,
    ) -> StoreResult<Option<Versioned<T>>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|error| map_sqlx_error(&error, operation))?;
        fetch(&mut conn, table, id, false, operation).await
    }

    fn publish(&self, changes: Vec<Change>) {
        for change in changes {
            // A send error only means nobody is subscribed.
            let _ = self.changes.send(change);
        }
    }

    async fn commit_atomic(&self, writes: Vec<Write>) -> StoreResult<CommitReceipt> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(&error, "begin"))?;
        let mut receipt = CommitReceipt::default();
        let mut changes = Vec::with_capacity(writes.len());

        for write in writes {
            match apply_write(&mut *tx, write).await? {
                Applied::Document(change) => {
                    receipt.applied.push((change.after.key(), change.version));
                    changes.push(change);
                }
                Applied::Notification => receipt.notifications += 1,
            }
        }

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(&error, "commit"))?;
        self.publish(changes);
        Ok(receipt)
    }

    async fn commit_best_effort(&self, writes: Vec<Write>) -> StoreResult<CommitReceipt> {
        let mut receipt = CommitReceipt::default();

        for write in writes {
            let key = write.key();
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|error| map_sqlx_error(&error, "begin"))?;
            match apply_write(&mut *tx, write).await {
                Ok(applied) => {
                    tx.commit()
                        .await
                        .map_err(|error| map_sqlx_error(&error, "commit"))?;
                    match applied {
                        Applied::Document(change) => {
                            receipt.applied.push((change.after.key(), change.version));
                            self.publish(vec![change]);
                        }
                        Applied::Notification => receipt.notifications += 1,
                    }
                }
                Err(conflict @ StoreError::VersionConflict { .. }) => {
                    if let Some(key) = key {
                        debug!(document = %key, "[postgres.commit] skipping conflicting write");
                        receipt.skipped.push(SkippedWrite {
                            key,
                            reason: conflict,
                        });
                    }
                }
                Err(other) => return Err(other),
            }
        }

        Ok(receipt)
    }
}

enum Applied {
    Document(Change),
    Notification,
}

/// Applies one write inside the caller's transaction.
async fn apply_write(conn: &mut PgConnection, write: Write) -> StoreResult<Applied> {
    match write {
        Write::Product { product, expected } => {
            let stock = i64::try_from(product.available_stock).map_err(|_| {
                StoreError::Serialization(format!(
                    "stock {} of product {} exceeds BIGINT",
                    product.available_stock, product.id
                ))
            })?;
            let key = DocumentKey::Product(product.id.clone());
            let before = fetch::<Product>(conn, Table::Products, product.id.as_ref(), true, "product").await?;
            check(&key, expected, before.as_ref())?;
            let version = save(
                conn,
                &key,
                Table::Products,
                query(&Table::Products.save(expected != ExpectedVersion::New))
                    .bind(product.id.as_ref())
                    .bind(Json(&product))
                    .bind(stock),
            )
            .await?;
            Ok(Applied::Document(Change {
                before: before.map(|v| Document::Product(v.document)),
                after: Document::Product(product),
                version,
            }))
        }
        Write::Order { order, expected } => {
            let key = DocumentKey::Order(order.id.clone());
            let before = fetch::<Order>(conn, Table::Orders, order.id.as_ref(), true, "order").await?;
            check(&key, expected, before.as_ref())?;
            let version = save(
                conn,
                &key,
                Table::Orders,
                query(&Table::Orders.save(expected != ExpectedVersion::New))
                    .bind(order.id.as_ref())
                    .bind(Json(&order))
                    .bind(order.status.as_str())
                    .bind(order.created_at.into_datetime()),
            )
            .await?;
            Ok(Applied::Document(Change {
                before: before.map(|v| Document::Order(v.document)),
                after: Document::Order(order),
                version,
            }))
        }
        Write::Payment { payment, expected } => {
            let key = DocumentKey::Payment(payment.id.clone());
            let before = fetch::<Payment>(conn, Table::Payments, payment.id.as_ref(), true, "payment").await?;
            check(&key, expected, before.as_ref())?;
            let version = save(
                conn,
                &key,
                Table::Payments,
                query(&Table::Payments.save(expected != ExpectedVersion::New))
                    .bind(payment.id.as_ref())
                    .bind(Json(&payment))
                    .bind(payment.order_id.as_ref().map(ToString::to_string)),
            )
            .await?;
            Ok(Applied::Document(Change {
                before: before.map(|v| Document::Payment(v.document)),
                after: Document::Payment(payment),
                version,
            }))
        }
        Write::Shipping(record) => {
            let key = DocumentKey::Shipping(record.order_id.clone());
            let before =
                fetch::<ShippingRecord>(conn, Table::Shipping, record.order_id.as_ref(), true, "shipping")
                    .await?;
            let version = save(
                conn,
                &key,
                Table::Shipping,
                query(&Table::Shipping.save(true))
                    .bind(record.order_id.as_ref())
                    .bind(Json(&record)),
            )
            .await?;
            Ok(Applied::Document(Change {
                before: before.map(|v| Document::Shipping(v.document)),
                after: Document::Shipping(record),
                version,
            }))
        }
        Write::Notification(notification) => {
            query(INSERT_NOTIFICATION)
                .bind(notification.kind.to_string())
                .bind(notification.order_id.as_ref().map(ToString::to_string))
                .bind(Json(&notification))
                .bind(notification.created_at.into_datetime())
                .execute(&mut *conn)
                .await
                .map_err(|error| map_sqlx_error(&error, "notification"))?;
            Ok(Applied::Notification)
        }
    }
}

fn check<T>(
    key: &DocumentKey,
    expected: ExpectedVersion,
    current: Option<&Versioned<T>>,
) -> StoreResult<()> {
    let current = current.map(|v| v.version);
    if expected.matches(current) {
        return Ok(());
    }
    warn!(
        document = %key,
        %expected,
        "[postgres.version_conflict] optimistic concurrency check failed"
    );
    Err(StoreError::VersionConflict {
        key: key.clone(),
        expected,
        current,
    })
}

async fn save(
    conn: &mut PgConnection,
    key: &DocumentKey,
    table: Table,
    statement: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
) -> StoreResult<DocVersion> {
    let row = statement.fetch_one(&mut *conn).await.map_err(|error| {
        if is_unique_violation(&error) {
            warn!(
                document = %key,
                table = table.name(),
                "[postgres.version_conflict] document was created concurrently"
            );
            StoreError::VersionConflict {
                key: key.clone(),
                expected: ExpectedVersion::New,
                current: None,
            }
        } else {
            map_sqlx_error(&error, "save")
        }
    })?;
    let raw: i64 = row
        .try_get("version")
        .map_err(|error| map_sqlx_error(&error, "save"))?;
    version_from_db(raw)
}

async fn fetch<T: DeserializeOwned + Send + Unpin>(
    conn: &mut PgConnection,
    table: Table,
    id: &str,
    lock: bool,
    operation: &'static str,
) -> StoreResult<Option<Versioned<T>>> {
    let row = query(&table.select(lock))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|error| map_sqlx_error(&error, operation))?;
    row.map(|row| versioned_from_row(&row, operation)).transpose()
}

fn versioned_from_row<T: DeserializeOwned>(
    row: &sqlx::postgres::PgRow,
    operation: &'static str,
) -> StoreResult<Versioned<T>> {
    let Json(document): Json<T> = row
        .try_get("document")
        .map_err(|error| map_sqlx_error(&error, operation))?;
    let raw: i64 = row
        .try_get("version")
        .map_err(|error| map_sqlx_error(&error, operation))?;
    Ok(Versioned::new(version_from_db(raw)?, document))
}

fn version_from_db(raw: i64) -> StoreResult<DocVersion> {
    u64::try_from(raw)
        .ok()
        .and_then(|version| DocVersion::try_new(version).ok())
        .ok_or_else(|| StoreError::Serialization(format!("invalid stored version {raw}")))
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db_error) if db_error.code().as_deref() == Some("23505"))
}

/// Deadlocks and serialization failures abort the transaction; the unit of
/// work can be retried.
fn is_transaction_conflict(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db_error)
            if matches!(db_error.code().as_deref(), Some("40001" | "40P01"))
    )
}

fn map_sqlx_error(error: &sqlx::Error, operation: &'static str) -> StoreError {
    match error {
        error if is_transaction_conflict(error) => {
            warn!(
                error = %error,
                operation,
                "[postgres.transaction_conflict] transaction aborted by a concurrent writer"
            );
            StoreError::Unavailable(format!("{operation}: {error}"))
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            warn!(
                error = %error,
                operation,
                "[postgres.unavailable] database could not be reached"
            );
            StoreError::Unavailable(format!("{operation}: {error}"))
        }
        sqlx::Error::Encode(_) | sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => {
            error!(
                error = %error,
                operation,
                "[postgres.serialization] document could not be converted"
            );
            StoreError::Serialization(format!("{operation}: {error}"))
        }
        _ => {
            error!(
                error = %error,
                operation,
                "[postgres.database_error] database operation failed"
            );
            StoreError::Internal(format!("{operation}: {error}"))
        }
    }
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    #[instrument(name = "postgres.product", skip(self))]
    async fn product(&self, id: &ProductId) -> StoreResult<Option<Versioned<Product>>> {
        self.read(Table::Products, id.as_ref(), "product").await
    }

    #[instrument(name = "postgres.order", skip(self))]
    async fn order(&self, id: &OrderId) -> StoreResult<Option<Versioned<Order>>> {
        self.read(Table::Orders, id.as_ref(), "order").await
    }

    #[instrument(name = "postgres.payment", skip(self))]
    async fn payment(&self, id: &PaymentId) -> StoreResult<Option<Versioned<Payment>>> {
        self.read(Table::Payments, id.as_ref(), "payment").await
    }

    #[instrument(name = "postgres.shipping", skip(self))]
    async fn shipping(&self, order_id: &OrderId) -> StoreResult<Option<Versioned<ShippingRecord>>> {
        self.read(Table::Shipping, order_id.as_ref(), "shipping").await
    }

    #[instrument(name = "postgres.orders_with_status", skip(self))]
    async fn orders_with_status(&self, status: OrderStatus) -> StoreResult<Vec<Versioned<Order>>> {
        let rows = query(SELECT_ORDERS_WITH_STATUS)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(&error, "orders_with_status"))?;
        rows.iter()
            .map(|row| versioned_from_row(row, "orders_with_status"))
            .collect()
    }

    #[instrument(name = "postgres.notifications", skip(self))]
    async fn notifications(&self) -> StoreResult<Vec<Notification>> {
        let rows = query(SELECT_NOTIFICATIONS)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(&error, "notifications"))?;
        rows.iter()
            .map(|row| {
                row.try_get::<Json<Notification>, _>("document")
                    .map(|Json(notification)| notification)
                    .map_err(|error| map_sqlx_error(&error, "notifications"))
            })
            .collect()
    }

    #[instrument(name = "postgres.commit", skip(self, batch), fields(mode = ?batch.mode(), writes = batch.len()))]
    async fn commit(&self, batch: WriteBatch) -> StoreResult<CommitReceipt> {
        if batch.is_empty() {
            return Ok(CommitReceipt::default());
        }
        match batch.mode() {
            CommitMode::Atomic => self.commit_atomic(batch.into_writes()).await,
            CommitMode::BestEffort => self.commit_best_effort(batch.into_writes()).await,
        }
    }

    fn subscribe(&self) -> ChangeFeed {
        self.changes.subscribe()
    }
}
