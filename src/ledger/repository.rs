use super::models::*;
use super::schema::{pending_migrations, CURRENT_SCHEMA_VERSION, SCHEMA};
use crate::error::{AppError, AppResult, LedgerError};
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::types::BigDecimal;
use sqlx::{Row, Sqlite, Transaction as DbTransaction};
use std::collections::HashSet;
use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};

const TX_COLUMNS: &str = "hash, payout_group_id, nonce, owner, spender, token_price, \
                          token_amount, raw, state, gas_used, created_at";

/// Ledger repository - THE source of truth for payout intents and transactions
///
/// One file per payout batch. Read-write handles hold an exclusive lock on a
/// sidecar `.lock` file for their whole lifetime; read-only handles never
/// take it, so audits can run next to a live pipeline.
pub struct LedgerRepository {
    pool: SqlitePool,
    path: PathBuf,
    read_only: bool,
    _lock: Option<File>,
}

impl LedgerRepository {
    // ========== LIFECYCLE ==========

    /// Create a new ledger at `path` at the current schema version.
    ///
    /// The file is built under a temporary name and linked into place, so a
    /// crash never leaves a half-created ledger at `path`.
    pub async fn initialize(path: impl AsRef<Path>) -> AppResult<()> {
        Self::create_file(path.as_ref(), SCHEMA, CURRENT_SCHEMA_VERSION).await
    }

    async fn create_file(path: &Path, statements: &[&str], version: i64) -> AppResult<()> {
        if path.exists() {
            return Err(LedgerError::AlreadyExists(path.to_path_buf()).into());
        }

        let tmp = sidecar_path(path, "init-tmp");
        if tmp.exists() {
            std::fs::remove_file(&tmp)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&tmp)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let result = Self::create_schema(&pool, statements, version).await;
        pool.close().await;

        if let Err(e) = result {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }

        publish(&tmp, path)?;
        info!(path = %path.display(), version, "Initialized ledger");
        Ok(())
    }

    async fn create_schema(pool: &SqlitePool, statements: &[&str], version: i64) -> AppResult<()> {
        let mut tx = pool.begin().await?;
        for statement in statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        sqlx::query("INSERT INTO metadata (id, version, attempts, created_at) VALUES (1, ?, 0, ?)")
            .bind(version)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Open an existing ledger, migrating it forward if it is older than
    /// this build. A ledger written by a newer build is refused.
    #[instrument(skip_all, fields(path = %path.as_ref().display(), read_only = read_only))]
    pub async fn open(path: impl AsRef<Path>, read_only: bool) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(LedgerError::NotFound(path.to_path_buf()).into());
        }

        let lock = if read_only {
            None
        } else {
            Some(acquire_lock(path)?)
        };

        let pool = Self::connect(path, read_only).await?;
        let version = match Self::read_version(&pool).await {
            Ok(version) => version,
            Err(e) => {
                pool.close().await;
                return Err(e);
            }
        };

        if version > CURRENT_SCHEMA_VERSION {
            pool.close().await;
            return Err(LedgerError::SchemaTooNew {
                found: version,
                supported: CURRENT_SCHEMA_VERSION,
            }
            .into());
        }

        let pool = if version < CURRENT_SCHEMA_VERSION {
            if read_only {
                pool.close().await;
                return Err(LedgerError::MigrationRequired {
                    found: version,
                    supported: CURRENT_SCHEMA_VERSION,
                }
                .into());
            }
            let result = Self::migrate(&pool, version).await;
            pool.close().await;
            result?;
            Self::connect(path, false).await?
        } else {
            pool
        };

        debug!(version = CURRENT_SCHEMA_VERSION, "Ledger opened");

        Ok(Self {
            pool,
            path: path.to_path_buf(),
            read_only,
            _lock: lock,
        })
    }

    async fn connect(path: &Path, read_only: bool) -> AppResult<SqlitePool> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let options = if read_only {
            options.read_only(true)
        } else {
            options.journal_mode(SqliteJournalMode::Wal)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(pool)
    }

    async fn read_version(pool: &SqlitePool) -> AppResult<i64> {
        let version = sqlx::query_scalar::<_, i64>("SELECT version FROM metadata WHERE id = 1")
            .fetch_one(pool)
            .await?;
        Ok(version)
    }

    /// Apply every pending step in one database transaction; on error the
    /// file is left at its original version.
    async fn migrate(pool: &SqlitePool, from: i64) -> AppResult<()> {
        let mut tx = pool.begin().await?;
        for migration in pending_migrations(from) {
            info!(
                from = migration.from,
                to = migration.from + 1,
                "Migrating ledger schema"
            );
            for statement in migration.statements {
                sqlx::query(statement).execute(&mut *tx).await?;
            }
        }
        sqlx::query("UPDATE metadata SET version = ? WHERE id = 1")
            .bind(CURRENT_SCHEMA_VERSION)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    // ========== METADATA ==========

    pub async fn fetch_metadata(&self) -> AppResult<Metadata> {
        let row = sqlx::query(
            "SELECT version, attempts, spender, owner, created_at FROM metadata WHERE id = 1",
        )
        .fetch_one(&self.pool)
        .await?;
        metadata_from_row(&row)
    }

    /// Count a pipeline start and pin the spender/owner pair on first use.
    ///
    /// Once recorded, running with a different spender or owner is a fatal
    /// misconfiguration.
    pub async fn record_pipeline_start(
        &self,
        spender: &str,
        owner: Option<&str>,
    ) -> AppResult<Metadata> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT version, attempts, spender, owner, created_at FROM metadata WHERE id = 1",
        )
        .fetch_one(&mut *tx)
        .await?;
        let metadata = metadata_from_row(&row)?;

        if let Some(recorded) = &metadata.spender {
            if recorded != spender {
                return Err(LedgerError::MetadataMismatch {
                    field: "spender",
                    recorded: recorded.clone(),
                    attempted: spender.to_string(),
                }
                .into());
            }
            if metadata.owner.as_deref() != owner {
                return Err(LedgerError::MetadataMismatch {
                    field: "owner",
                    recorded: metadata.owner.clone().unwrap_or_else(|| "<none>".to_string()),
                    attempted: owner.unwrap_or("<none>").to_string(),
                }
                .into());
            }
        }

        sqlx::query(
            "UPDATE metadata SET attempts = attempts + 1, spender = ?, owner = ? WHERE id = 1",
        )
        .bind(spender)
        .bind(owner)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Metadata {
            attempts: metadata.attempts + 1,
            spender: Some(spender.to_string()),
            owner: owner.map(str::to_string),
            ..metadata
        })
    }

    // ========== PAYOUT OPERATIONS ==========

    /// Create one payout group and its payouts atomically
    pub async fn create_payout_group(&self, id: i64, payouts: &[Payout]) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::insert_payout_group(&mut tx, id, payouts).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Create many payout groups in a single transaction; all or none
    pub async fn create_payout_groups(&self, groups: &[(i64, Vec<Payout>)]) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        for (id, payouts) in groups {
            Self::insert_payout_group(&mut tx, *id, payouts).await?;
        }
        tx.commit().await?;
        info!(count = groups.len(), "Created payout groups");
        Ok(())
    }

    async fn insert_payout_group(
        tx: &mut DbTransaction<'_, Sqlite>,
        id: i64,
        payouts: &[Payout],
    ) -> AppResult<()> {
        if payouts.is_empty() {
            return Err(LedgerError::InvalidRow(format!("payout group {} has no payouts", id)).into());
        }
        if let Some(stray) = payouts.iter().find(|p| p.payout_group_id != id) {
            return Err(LedgerError::InvalidRow(format!(
                "payout on line {} belongs to group {}, not {}",
                stray.line, stray.payout_group_id, id
            ))
            .into());
        }

        sqlx::query("INSERT INTO payout_groups (id) VALUES (?)")
            .bind(id)
            .execute(&mut **tx)
            .await?;

        for payout in payouts {
            sqlx::query(
                r#"
                INSERT INTO payouts (line, address, amount, payout_group_id, mandatory, bonus)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(payout.line)
            .bind(&payout.address)
            .bind(payout.amount.to_string())
            .bind(id)
            .bind(payout.mandatory)
            .bind(payout.bonus)
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }

    /// Lowest-id group with no final hash and no pending transaction.
    /// This is the only way work enters the pipeline.
    pub async fn fetch_first_unfinished_unattached_payout_group(
        &self,
    ) -> AppResult<Option<PayoutGroup>> {
        let row = sqlx::query(
            r#"
            SELECT g.id, g.final_tx_hash
            FROM payout_groups g
            WHERE g.final_tx_hash IS NULL
              AND NOT EXISTS (
                  SELECT 1 FROM transactions t
                  WHERE t.payout_group_id = g.id AND t.state = 'pending'
              )
            ORDER BY g.id ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| payout_group_from_row(&r)).transpose()
    }

    pub async fn fetch_payout_groups(&self) -> AppResult<Vec<PayoutGroup>> {
        let rows = sqlx::query("SELECT id, final_tx_hash FROM payout_groups ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(payout_group_from_row).collect()
    }

    pub async fn fetch_payouts(&self) -> AppResult<Vec<Payout>> {
        let rows = sqlx::query(
            r#"
            SELECT line, address, amount, payout_group_id, mandatory, bonus
            FROM payouts
            ORDER BY payout_group_id ASC, line ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(payout_from_row).collect()
    }

    pub async fn fetch_payouts_for_group(&self, payout_group_id: i64) -> AppResult<Vec<Payout>> {
        let rows = sqlx::query(
            r#"
            SELECT line, address, amount, payout_group_id, mandatory, bonus
            FROM payouts
            WHERE payout_group_id = ?
            ORDER BY line ASC
            "#,
        )
        .bind(payout_group_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(payout_from_row).collect()
    }

    // ========== TRANSACTION OPERATIONS ==========

    /// Record a new broadcast attempt in Pending state. The hash is the
    /// de-duplication key; recording the same hash twice is refused.
    pub async fn create_transaction(&self, tx: &Transaction) -> AppResult<()> {
        let nonce = nonce_to_db(tx.nonce)?;

        sqlx::query(
            r#"
            INSERT INTO transactions (
                hash, payout_group_id, nonce, owner, spender, token_price,
                token_amount, raw, state, gas_used, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?)
            "#,
        )
        .bind(&tx.hash)
        .bind(tx.payout_group_id)
        .bind(nonce)
        .bind(&tx.owner)
        .bind(&tx.spender)
        .bind(tx.token_price.to_string())
        .bind(tx.token_amount.to_string())
        .bind(&tx.raw)
        .bind(TxState::Pending.as_str())
        .bind(tx.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                AppError::from(LedgerError::DuplicateTransaction(tx.hash.clone()))
            }
            other => AppError::from(other),
        })?;

        debug!(hash = %tx.hash, nonce = tx.nonce, group = tx.payout_group_id, "Recorded transaction");
        Ok(())
    }

    pub async fn fetch_transactions(&self) -> AppResult<Vec<Transaction>> {
        let sql = format!("SELECT {} FROM transactions ORDER BY nonce ASC, id ASC", TX_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(transaction_from_row).collect()
    }

    /// Every pending transaction, coalesced into nonce groups in ascending
    /// nonce order. Used to rebuild the scheduler window after a restart.
    pub async fn fetch_unfinished_transactions_sorted_into_nonce_groups(
        &self,
    ) -> AppResult<Vec<NonceGroup>> {
        let sql = format!(
            "SELECT {} FROM transactions WHERE state = ? ORDER BY nonce ASC, id ASC",
            TX_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(TxState::Pending.as_str())
            .fetch_all(&self.pool)
            .await?;
        let txs = rows
            .iter()
            .map(transaction_from_row)
            .collect::<AppResult<Vec<_>>>()?;

        Ok(sort_into_nonce_groups(txs)?)
    }

    /// Record the outcome of a nonce group atomically.
    ///
    /// Every transaction in the group leaves Pending: reported states are
    /// written as-is, while siblings still reported Pending (or not reported)
    /// are superseded and recorded as Dropped. A Confirmed status stamps the
    /// payout group's final hash, which may only ever be set once.
    pub async fn finalize_nonce_group(
        &self,
        group: &NonceGroup,
        statuses: &[TxStatus],
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        let mut recorded = HashSet::new();
        let mut confirmed: Option<&str> = None;

        for status in statuses {
            if !group.txs.iter().any(|t| t.hash == status.hash) {
                return Err(LedgerError::UnknownTransaction(status.hash.clone()).into());
            }

            let state = match status.state {
                TxState::Pending => TxState::Dropped,
                other => other,
            };

            let result = sqlx::query(
                r#"
                UPDATE transactions
                SET state = ?, gas_used = COALESCE(?, gas_used)
                WHERE hash = ? AND payout_group_id = ? AND state = ?
                "#,
            )
            .bind(state.as_str())
            .bind(status.receipt.map(|r| r.gas_used))
            .bind(&status.hash)
            .bind(group.payout_group_id)
            .bind(TxState::Pending.as_str())
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(LedgerError::UnknownTransaction(status.hash.clone()).into());
            }

            recorded.insert(status.hash.as_str());
            if state == TxState::Confirmed {
                confirmed = Some(status.hash.as_str());
            }
        }

        for sibling in group.txs.iter().filter(|t| !recorded.contains(t.hash.as_str())) {
            sqlx::query("UPDATE transactions SET state = ? WHERE hash = ? AND state = ?")
                .bind(TxState::Dropped.as_str())
                .bind(&sibling.hash)
                .bind(TxState::Pending.as_str())
                .execute(&mut *tx)
                .await?;
        }

        if let Some(hash) = confirmed {
            let existing = sqlx::query_scalar::<_, Option<String>>(
                "SELECT final_tx_hash FROM payout_groups WHERE id = ?",
            )
            .bind(group.payout_group_id)
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                None => {
                    return Err(LedgerError::InvalidRow(format!(
                        "payout group {} does not exist",
                        group.payout_group_id
                    ))
                    .into());
                }
                Some(Some(existing)) if existing != hash => {
                    return Err(LedgerError::FinalHashConflict {
                        payout_group_id: group.payout_group_id,
                        existing,
                        attempted: hash.to_string(),
                    }
                    .into());
                }
                Some(Some(_)) => {}
                Some(None) => {
                    sqlx::query(
                        "UPDATE payout_groups SET final_tx_hash = ? WHERE id = ? AND final_tx_hash IS NULL",
                    )
                    .bind(hash)
                    .bind(group.payout_group_id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    // ========== STATS ==========

    pub async fn stats(&self) -> AppResult<LedgerStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM payout_groups),
                (SELECT COUNT(*) FROM payout_groups WHERE final_tx_hash IS NULL),
                (SELECT COUNT(*) FROM payouts),
                (SELECT COUNT(*) FROM payouts p
                    JOIN payout_groups g ON p.payout_group_id = g.id
                    WHERE g.final_tx_hash IS NULL),
                (SELECT COUNT(*) FROM transactions),
                (SELECT COUNT(*) FROM transactions WHERE state = 'pending'),
                (SELECT COUNT(*) FROM transactions WHERE state = 'confirmed'),
                (SELECT COUNT(*) FROM transactions WHERE state = 'failed'),
                (SELECT COUNT(*) FROM transactions WHERE state = 'dropped')
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(LedgerStats {
            total_payout_groups: row.try_get(0)?,
            pending_payout_groups: row.try_get(1)?,
            total_payouts: row.try_get(2)?,
            pending_payouts: row.try_get(3)?,
            total_transactions: row.try_get(4)?,
            pending_transactions: row.try_get(5)?,
            confirmed_transactions: row.try_get(6)?,
            failed_transactions: row.try_get(7)?,
            dropped_transactions: row.try_get(8)?,
        })
    }

    pub async fn fetch_payout_progress(&self) -> AppResult<PayoutProgress> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM payouts),
                (SELECT COUNT(*) FROM payouts p
                    JOIN payout_groups g ON p.payout_group_id = g.id
                    WHERE g.final_tx_hash IS NULL)
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(PayoutProgress {
            total_payouts: row.try_get(0)?,
            pending_payouts: row.try_get(1)?,
        })
    }
}

/// Coalesce nonce-ordered transactions into nonce groups
pub fn sort_into_nonce_groups(txs: Vec<Transaction>) -> Result<Vec<NonceGroup>, LedgerError> {
    let mut groups: Vec<NonceGroup> = Vec::new();
    for tx in txs {
        match groups.last_mut() {
            Some(last) if last.nonce == tx.nonce => {
                if last.payout_group_id != tx.payout_group_id {
                    return Err(LedgerError::NonceGroupCorrupted {
                        nonce: tx.nonce,
                        first: last.payout_group_id,
                        second: tx.payout_group_id,
                    });
                }
                last.txs.push(tx);
            }
            Some(last) if last.nonce > tx.nonce => {
                return Err(LedgerError::InvalidRow(format!(
                    "transactions out of nonce order: {} after {}",
                    tx.nonce, last.nonce
                )));
            }
            _ => groups.push(NonceGroup::new(tx)),
        }
    }
    Ok(groups)
}

fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Move a finished temp ledger to `path`, never replacing a file that
/// appeared there in the meantime
fn publish(tmp: &Path, path: &Path) -> AppResult<()> {
    let linked = std::fs::hard_link(tmp, path);
    let _ = std::fs::remove_file(tmp);
    match linked {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(LedgerError::AlreadyExists(path.to_path_buf()).into())
        }
        Err(e) => Err(e.into()),
    }
}

fn acquire_lock(path: &Path) -> AppResult<File> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(sidecar_path(path, "lock"))?;

    match file.try_lock() {
        Ok(()) => Ok(file),
        Err(TryLockError::WouldBlock) => Err(LedgerError::Locked(path.to_path_buf()).into()),
        Err(TryLockError::Error(e)) => Err(e.into()),
    }
}

fn nonce_to_db(nonce: u64) -> AppResult<i64> {
    i64::try_from(nonce)
        .map_err(|_| LedgerError::InvalidRow(format!("nonce {} out of range", nonce)).into())
}

fn parse_decimal(column: &str, value: &str) -> Result<Decimal, LedgerError> {
    Decimal::from_str(value)
        .map_err(|_| LedgerError::InvalidRow(format!("invalid {} '{}'", column, value)))
}

fn metadata_from_row(row: &SqliteRow) -> AppResult<Metadata> {
    Ok(Metadata {
        version: row.try_get("version")?,
        attempts: row.try_get("attempts")?,
        spender: row.try_get("spender")?,
        owner: row.try_get("owner")?,
        created_at: row.try_get("created_at")?,
    })
}

fn payout_group_from_row(row: &SqliteRow) -> AppResult<PayoutGroup> {
    Ok(PayoutGroup {
        id: row.try_get("id")?,
        final_tx_hash: row.try_get("final_tx_hash")?,
    })
}

fn payout_from_row(row: &SqliteRow) -> AppResult<Payout> {
    let amount: String = row.try_get("amount")?;
    Ok(Payout {
        line: row.try_get("line")?,
        address: row.try_get("address")?,
        amount: parse_decimal("amount", &amount)?,
        payout_group_id: row.try_get("payout_group_id")?,
        mandatory: row.try_get("mandatory")?,
        bonus: row.try_get("bonus")?,
    })
}

fn transaction_from_row(row: &SqliteRow) -> AppResult<Transaction> {
    let nonce: i64 = row.try_get("nonce")?;
    let token_price: String = row.try_get("token_price")?;
    let token_amount: String = row.try_get("token_amount")?;
    let state: String = row.try_get("state")?;
    let gas_used: Option<i64> = row.try_get("gas_used")?;

    Ok(Transaction {
        hash: row.try_get("hash")?,
        payout_group_id: row.try_get("payout_group_id")?,
        nonce: u64::try_from(nonce)
            .map_err(|_| LedgerError::InvalidRow(format!("negative nonce {}", nonce)))?,
        owner: row.try_get("owner")?,
        spender: row.try_get("spender")?,
        token_price: parse_decimal("token_price", &token_price)?,
        token_amount: BigDecimal::from_str(&token_amount).map_err(|_| {
            LedgerError::InvalidRow(format!("invalid token_amount '{}'", token_amount))
        })?,
        raw: row.try_get("raw")?,
        state: state.parse()?,
        receipt: gas_used.map(|gas_used| TxReceipt { gas_used }),
        created_at: row.try_get("created_at")?,
    })
}
