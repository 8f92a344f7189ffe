//! Table definitions and the statements that read and write them.
//!
//! Every table keeps the full document as JSONB next to its version. The
//! few columns the store filters or constrains on are duplicated out of the
//! document: product stock (guarded by a `CHECK`), order status and creation
//! time (scanned by the sweep), and the order a payment belongs to.

/// Advisory lock key serialising concurrent migrations.
pub(crate) const MIGRATION_LOCK: i64 = 0x6f72_6465_7263_6f72;

/// Idempotent DDL, applied in order.
pub(crate) const MIGRATIONS: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS ordercore_products (
        id TEXT PRIMARY KEY,
        available_stock BIGINT NOT NULL CHECK (available_stock >= 0),
        document JSONB NOT NULL,
        version BIGINT NOT NULL CHECK (version >= 1)
    )",
    r"CREATE TABLE IF NOT EXISTS ordercore_orders (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        document JSONB NOT NULL,
        version BIGINT NOT NULL CHECK (version >= 1)
    )",
    r"CREATE INDEX IF NOT EXISTS ordercore_orders_status_idx
        ON ordercore_orders (status, created_at, id)",
    r"CREATE TABLE IF NOT EXISTS ordercore_payments (
        id TEXT PRIMARY KEY,
        order_id TEXT,
        document JSONB NOT NULL,
        version BIGINT NOT NULL CHECK (version >= 1)
    )",
    r"CREATE TABLE IF NOT EXISTS ordercore_shipping (
        id TEXT PRIMARY KEY,
        document JSONB NOT NULL,
        version BIGINT NOT NULL CHECK (version >= 1)
    )",
    r"CREATE TABLE IF NOT EXISTS ordercore_notifications (
        seq BIGSERIAL PRIMARY KEY,
        kind TEXT NOT NULL,
        order_id TEXT,
        document JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )",
];

/// A document table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Table {
    Products,
    Orders,
    Payments,
    Shipping,
}

impl Table {
    pub(crate) const fn name(self) -> &'static str {
        match self {
            Self::Products => "ordercore_products",
            Self::Orders => "ordercore_orders",
            Self::Payments => "ordercore_payments",
            Self::Shipping => "ordercore_shipping",
        }
    }

    pub(crate) fn select(self, lock: bool) -> String {
        let suffix = if lock { " FOR UPDATE" } else { "" };
        format!(
            "SELECT document, version FROM {} WHERE id = $1{suffix}",
            self.name()
        )
    }

    /// Insert statement. `$1` is the id, `$2` the document; the remaining
    /// parameters are the table's extra columns. With `replace`, an existing
    /// row is overwritten and its version bumped.
    pub(crate) fn save(self, replace: bool) -> String {
        let table = self.name();
        let (columns, values, updates) = match self {
            Self::Products => (
                ", available_stock",
                ", $3",
                ", available_stock = EXCLUDED.available_stock",
            ),
            Self::Orders => (
                ", status, created_at",
                ", $3, $4",
                ", status = EXCLUDED.status, created_at = EXCLUDED.created_at",
            ),
            Self::Payments => (", order_id", ", $3", ", order_id = EXCLUDED.order_id"),
            Self::Shipping => ("", "", ""),
        };
        let conflict = if replace {
            format!(
                " ON CONFLICT (id) DO UPDATE SET document = EXCLUDED.document, \
                 version = {table}.version + 1{updates}"
            )
        } else {
            String::new()
        };
        format!(
            "INSERT INTO {table} (id, document, version{columns}) \
             VALUES ($1, $2, 1{values}){conflict} RETURNING version"
        )
    }
}

pub(crate) const SELECT_ORDERS_WITH_STATUS: &str = "SELECT document, version FROM ordercore_orders \
     WHERE status = $1 ORDER BY created_at, id";

pub(crate) const INSERT_NOTIFICATION: &str = "INSERT INTO ordercore_notifications \
     (kind, order_id, document, created_at) VALUES ($1, $2, $3, $4)";

pub(crate) const SELECT_NOTIFICATIONS: &str =
    "SELECT document FROM ordercore_notifications ORDER BY seq";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_insert_has_no_conflict_clause() {
        let sql = Table::Orders.save(false);
        assert!(sql.starts_with("INSERT INTO ordercore_orders (id, document, version, status, created_at)"));
        assert!(!sql.contains("ON CONFLICT"));
        assert!(sql.ends_with("RETURNING version"));
    }

    #[test]
    fn replacing_insert_bumps_version() {
        let sql = Table::Products.save(true);
        assert!(sql.contains("version = ordercore_products.version + 1"));
        assert!(sql.contains("available_stock = EXCLUDED.available_stock"));
    }

    #[test]
    fn locking_select() {
        assert!(Table::Shipping.select(true).ends_with("FOR UPDATE"));
        assert!(!Table::Payments.select(false).contains("FOR UPDATE"));
    }
}
