//! Versioned ledger schema.
//!
//! New ledgers are created directly at [`CURRENT_SCHEMA_VERSION`]. Older files
//! are brought forward by applying every step in [`MIGRATIONS`] whose
//! `from` version is at or above the stored version, in order, inside a
//! single database transaction.

pub const CURRENT_SCHEMA_VERSION: i64 = 3;

/// Statements that create a fresh ledger at the current version
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE metadata (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        version INTEGER NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        spender TEXT,
        owner TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE payout_groups (
        id INTEGER PRIMARY KEY,
        final_tx_hash TEXT
    )
    "#,
    r#"
    CREATE TABLE payouts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        line INTEGER NOT NULL,
        address TEXT NOT NULL,
        amount TEXT NOT NULL,
        payout_group_id INTEGER NOT NULL REFERENCES payout_groups(id),
        mandatory INTEGER NOT NULL DEFAULT 0,
        bonus INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX payouts_group ON payouts(payout_group_id)",
    r#"
    CREATE TABLE transactions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        hash TEXT NOT NULL UNIQUE,
        payout_group_id INTEGER NOT NULL REFERENCES payout_groups(id),
        nonce INTEGER NOT NULL,
        owner TEXT NOT NULL,
        spender TEXT NOT NULL,
        token_price TEXT NOT NULL,
        token_amount TEXT NOT NULL,
        raw BLOB NOT NULL,
        state TEXT NOT NULL,
        created_at TEXT NOT NULL,
        gas_used INTEGER
    )
    "#,
    "CREATE INDEX transactions_group ON transactions(payout_group_id)",
    "CREATE INDEX transactions_state_nonce ON transactions(state, nonce)",
];

/// The first released schema. Kept so migrations can be exercised.
pub const SCHEMA_V1: &[&str] = &[
    r#"
    CREATE TABLE metadata (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        version INTEGER NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        spender TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE payout_groups (
        id INTEGER PRIMARY KEY,
        final_tx_hash TEXT
    )
    "#,
    r#"
    CREATE TABLE payouts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        line INTEGER NOT NULL,
        address TEXT NOT NULL,
        amount TEXT NOT NULL,
        payout_group_id INTEGER NOT NULL REFERENCES payout_groups(id)
    )
    "#,
    "CREATE INDEX payouts_group ON payouts(payout_group_id)",
    r#"
    CREATE TABLE transactions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        hash TEXT NOT NULL UNIQUE,
        payout_group_id INTEGER NOT NULL REFERENCES payout_groups(id),
        nonce INTEGER NOT NULL,
        owner TEXT NOT NULL,
        spender TEXT NOT NULL,
        token_price TEXT NOT NULL,
        token_amount TEXT NOT NULL,
        raw BLOB NOT NULL,
        state TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX transactions_group ON transactions(payout_group_id)",
];

/// One forward step from `from` to `from + 1`
pub struct Migration {
    pub from: i64,
    pub statements: &'static [&'static str],
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        from: 1,
        statements: &[
            "ALTER TABLE transactions ADD COLUMN gas_used INTEGER",
            "CREATE INDEX transactions_state_nonce ON transactions(state, nonce)",
        ],
    },
    Migration {
        from: 2,
        statements: &[
            "ALTER TABLE metadata ADD COLUMN owner TEXT",
            "ALTER TABLE payouts ADD COLUMN mandatory INTEGER NOT NULL DEFAULT 0",
            "ALTER TABLE payouts ADD COLUMN bonus INTEGER NOT NULL DEFAULT 0",
        ],
    },
];

/// Steps needed to bring `version` up to date
pub fn pending_migrations(version: i64) -> impl Iterator<Item = &'static Migration> {
    MIGRATIONS.iter().filter(move |m| m.from >= version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_contiguous() {
        let mut expected = 1;
        for migration in MIGRATIONS {
            assert_eq!(migration.from, expected);
            expected += 1;
        }
        assert_eq!(expected, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_pending_migrations() {
        assert_eq!(pending_migrations(1).count(), 2);
        assert_eq!(pending_migrations(2).count(), 1);
        assert_eq!(pending_migrations(CURRENT_SCHEMA_VERSION).count(), 0);
    }
}
