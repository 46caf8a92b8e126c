//! Generic object-store operations over the typed collections.
//!
//! Every collection is a table of `(seq, id, <index columns>, data)` rows where
//! `data` is the JSON-encoded record. `seq` gives the storage order used by
//! full scans.

use futures::TryStreamExt;
use sqlx::{Executor, QueryBuilder, Sqlite, SqliteConnection};

use super::schema::Database;
use super::types::{Collection, Index, Record, StorageError};

/// Rows per multi-value INSERT statement in bulk writes
const BATCH_SIZE: usize = 100;

// ============================================================================
// Encoding
// ============================================================================

/// A record flattened into the column values of its table.
struct EncodedRecord {
    key: String,
    indexes: Vec<Option<String>>,
    data: String,
}

impl EncodedRecord {
    fn encode<R: Record>(record: &R) -> Result<Self, StorageError> {
        Ok(Self {
            key: record.key().to_owned(),
            indexes: R::COLLECTION
                .indexes()
                .iter()
                .map(|index| record.index_value(*index).map(str::to_owned))
                .collect(),
            data: serde_json::to_string(record)?,
        })
    }
}

fn decode<R: Record>(data: &str) -> Result<R, StorageError> {
    Ok(serde_json::from_str(data)?)
}

fn check_index<R: Record>(index: Index) -> Result<(), StorageError> {
    if index.collection() != R::COLLECTION {
        return Err(StorageError::UnknownIndex {
            collection: R::COLLECTION.name(),
            index: index.name(),
        });
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Insert,
    Upsert,
}

/// Build a multi-row INSERT for `rows`, turning it into an upsert on the
/// primary key when requested.
fn write_statement(
    collection: Collection,
    rows: &[EncodedRecord],
    mode: WriteMode,
) -> QueryBuilder<'static, Sqlite> {
    let index_columns: Vec<&str> = collection.indexes().iter().map(|i| i.column()).collect();

    let mut columns = vec!["id"];
    columns.extend(index_columns.iter().copied());
    columns.push("data");

    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) ",
        collection.table(),
        columns.join(", ")
    ));

    builder.push_values(rows, |mut b, row| {
        b.push_bind(row.key.clone());
        for value in &row.indexes {
            b.push_bind(value.clone());
        }
        b.push_bind(row.data.clone());
    });

    if mode == WriteMode::Upsert {
        let updates: Vec<String> = index_columns
            .iter()
            .copied()
            .chain(std::iter::once("data"))
            .map(|c| format!("{c} = excluded.{c}"))
            .collect();
        builder.push(format!(" ON CONFLICT(id) DO UPDATE SET {}", updates.join(", ")));
    }

    builder
}

async fn write_rows<'e, E>(
    exec: E,
    collection: Collection,
    rows: &[EncodedRecord],
    mode: WriteMode,
) -> Result<u64, StorageError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let mut builder = write_statement(collection, rows, mode);
    let result = builder
        .build()
        .execute(exec)
        .await
        .map_err(|e| StorageError::from_write(collection, e))?;
    Ok(result.rows_affected())
}

async fn update_row<'e, E>(
    exec: E,
    collection: Collection,
    row: &EncodedRecord,
) -> Result<bool, StorageError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let mut builder: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("UPDATE {} SET ", collection.table()));
    {
        let mut assignments = builder.separated(", ");
        for (index, value) in collection.indexes().iter().zip(&row.indexes) {
            assignments.push(format!("{} = ", index.column()));
            assignments.push_bind_unseparated(value.clone());
        }
        assignments.push("data = ");
        assignments.push_bind_unseparated(row.data.clone());
    }
    builder.push(" WHERE id = ");
    builder.push_bind(row.key.clone());

    let result = builder
        .build()
        .execute(exec)
        .await
        .map_err(|e| StorageError::from_write(collection, e))?;
    Ok(result.rows_affected() > 0)
}

async fn fetch_by_key<'e, R, E>(exec: E, key: &str) -> Result<Option<R>, StorageError>
where
    R: Record,
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT data FROM {} WHERE id = ?", R::COLLECTION.table());
    let row: Option<(String,)> = sqlx::query_as(&sql).bind(key).fetch_optional(exec).await?;
    row.map(|(data,)| decode(&data)).transpose()
}

async fn fetch_all<'e, R, E>(exec: E, filter: Option<(Index, &str)>) -> Result<Vec<R>, StorageError>
where
    R: Record,
    E: Executor<'e, Database = Sqlite>,
{
    let table = R::COLLECTION.table();
    let sql = match filter {
        Some((index, _)) => format!(
            "SELECT data FROM {} WHERE {} = ? ORDER BY seq",
            table,
            index.column()
        ),
        None => format!("SELECT data FROM {} ORDER BY seq", table),
    };

    let mut query = sqlx::query_as::<_, (String,)>(&sql);
    if let Some((_, value)) = filter {
        query = query.bind(value);
    }

    // Forward cursor: rows are decoded one at a time as SQLite yields them
    let mut cursor = query.fetch(exec);
    let mut records = Vec::new();
    while let Some((data,)) = cursor.try_next().await? {
        records.push(decode(&data)?);
    }
    Ok(records)
}

async fn delete_where<'e, E>(
    exec: E,
    collection: Collection,
    column: &str,
    value: &str,
) -> Result<u64, StorageError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("DELETE FROM {} WHERE {} = ?", collection.table(), column);
    let result = sqlx::query(&sql).bind(value).execute(exec).await?;
    Ok(result.rows_affected())
}

async fn clear_table<'e, E>(exec: E, collection: Collection) -> Result<u64, StorageError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("DELETE FROM {}", collection.table());
    let result = sqlx::query(&sql).execute(exec).await?;
    Ok(result.rows_affected())
}

/// Write `records` in chunks on one connection; the caller owns the transaction.
async fn write_all<R: Record>(
    conn: &mut SqliteConnection,
    records: &[R],
    mode: WriteMode,
) -> Result<u64, StorageError> {
    let rows = records
        .iter()
        .map(EncodedRecord::encode)
        .collect::<Result<Vec<_>, _>>()?;

    let mut written = 0;
    for chunk in rows.chunks(BATCH_SIZE) {
        written += write_rows(&mut *conn, R::COLLECTION, chunk, mode).await?;
    }
    Ok(written)
}

// ============================================================================
// Database Operations
// ============================================================================

impl Database {
    /// Add a new record.
    ///
    /// # Errors
    ///
    /// [`StorageError::ConstraintViolation`] if the key or a unique index value
    /// is already present.
    pub async fn insert<R: Record>(&self, record: &R) -> Result<(), StorageError> {
        let row = EncodedRecord::encode(record)?;
        write_rows(self.pool()?, R::COLLECTION, std::slice::from_ref(&row), WriteMode::Insert)
            .await?;
        Ok(())
    }

    /// Insert or replace a record by primary key.
    ///
    /// A unique index value owned by a *different* record is still rejected.
    pub async fn upsert<R: Record>(&self, record: &R) -> Result<(), StorageError> {
        let row = EncodedRecord::encode(record)?;
        write_rows(self.pool()?, R::COLLECTION, std::slice::from_ref(&row), WriteMode::Upsert)
            .await?;
        Ok(())
    }

    /// Replace an existing record. Returns `false` when no record has that key.
    pub async fn update<R: Record>(&self, record: &R) -> Result<bool, StorageError> {
        let row = EncodedRecord::encode(record)?;
        update_row(self.pool()?, R::COLLECTION, &row).await
    }

    pub async fn get_by_key<R: Record>(&self, key: &str) -> Result<Option<R>, StorageError> {
        fetch_by_key(self.pool()?, key).await
    }

    /// First record whose `index` equals `value`, in storage order.
    pub async fn get_by_index<R: Record>(
        &self,
        index: Index,
        value: &str,
    ) -> Result<Option<R>, StorageError> {
        check_index::<R>(index)?;
        let sql = format!(
            "SELECT data FROM {} WHERE {} = ? ORDER BY seq LIMIT 1",
            R::COLLECTION.table(),
            index.column()
        );
        let row: Option<(String,)> = sqlx::query_as(&sql)
            .bind(value)
            .fetch_optional(self.pool()?)
            .await?;
        row.map(|(data,)| decode(&data)).transpose()
    }

    pub async fn get_all_by_index<R: Record>(
        &self,
        index: Index,
        value: &str,
    ) -> Result<Vec<R>, StorageError> {
        check_index::<R>(index)?;
        fetch_all(self.pool()?, Some((index, value))).await
    }

    /// Every record of the collection in storage order.
    pub async fn get_all<R: Record>(&self) -> Result<Vec<R>, StorageError> {
        fetch_all(self.pool()?, None).await
    }

    pub async fn count<R: Record>(&self) -> Result<u64, StorageError> {
        let sql = format!("SELECT COUNT(*) FROM {}", R::COLLECTION.table());
        let (count,): (i64,) = sqlx::query_as(&sql).fetch_one(self.pool()?).await?;
        Ok(count as u64)
    }

    /// Remove a record by key. Absent keys are not an error; returns whether
    /// a record was removed.
    pub async fn delete<R: Record>(&self, key: &str) -> Result<bool, StorageError> {
        let removed = delete_where(self.pool()?, R::COLLECTION, "id", key).await?;
        Ok(removed > 0)
    }

    pub async fn delete_by_index<R: Record>(
        &self,
        index: Index,
        value: &str,
    ) -> Result<u64, StorageError> {
        check_index::<R>(index)?;
        delete_where(self.pool()?, R::COLLECTION, index.column(), value).await
    }

    /// Remove every record of the collection, returning how many were removed.
    pub async fn clear<R: Record>(&self) -> Result<u64, StorageError> {
        clear_table(self.pool()?, R::COLLECTION).await
    }

    /// Insert all records in one transaction; any failure rejects the batch.
    pub async fn bulk_insert<R: Record>(&self, records: &[R]) -> Result<u64, StorageError> {
        self.bulk_write(records, WriteMode::Insert).await
    }

    /// Upsert all records in one transaction; any failure rejects the batch.
    pub async fn bulk_upsert<R: Record>(&self, records: &[R]) -> Result<u64, StorageError> {
        self.bulk_write(records, WriteMode::Upsert).await
    }

    async fn bulk_write<R: Record>(
        &self,
        records: &[R],
        mode: WriteMode,
    ) -> Result<u64, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool()?.begin().await?;
        let written = write_all(&mut tx, records, mode).await?;
        tx.commit().await?;
        Ok(written)
    }

    /// Start a write transaction. Dropping it without [`WriteTx::commit`]
    /// rolls every change back.
    pub async fn begin(&self) -> Result<WriteTx, StorageError> {
        let tx = self.pool()?.begin().await?;
        Ok(WriteTx { tx })
    }
}

// ============================================================================
// Write Transactions
// ============================================================================

/// A transaction spanning any number of collections.
///
/// Issue a write before the first read where possible: a transaction that
/// starts with a read has to upgrade its lock later and can fail fast with
/// SQLITE_BUSY under concurrent writers.
pub struct WriteTx {
    tx: sqlx::Transaction<'static, Sqlite>,
}

impl WriteTx {
    pub async fn insert<R: Record>(&mut self, record: &R) -> Result<(), StorageError> {
        let row = EncodedRecord::encode(record)?;
        write_rows(&mut *self.tx, R::COLLECTION, std::slice::from_ref(&row), WriteMode::Insert)
            .await?;
        Ok(())
    }

    pub async fn upsert<R: Record>(&mut self, record: &R) -> Result<(), StorageError> {
        let row = EncodedRecord::encode(record)?;
        write_rows(&mut *self.tx, R::COLLECTION, std::slice::from_ref(&row), WriteMode::Upsert)
            .await?;
        Ok(())
    }

    pub async fn update<R: Record>(&mut self, record: &R) -> Result<bool, StorageError> {
        let row = EncodedRecord::encode(record)?;
        update_row(&mut *self.tx, R::COLLECTION, &row).await
    }

    pub async fn insert_all<R: Record>(&mut self, records: &[R]) -> Result<u64, StorageError> {
        write_all(&mut self.tx, records, WriteMode::Insert).await
    }

    pub async fn upsert_all<R: Record>(&mut self, records: &[R]) -> Result<u64, StorageError> {
        write_all(&mut self.tx, records, WriteMode::Upsert).await
    }

    pub async fn get_by_key<R: Record>(&mut self, key: &str) -> Result<Option<R>, StorageError> {
        fetch_by_key(&mut *self.tx, key).await
    }

    pub async fn get_all<R: Record>(&mut self) -> Result<Vec<R>, StorageError> {
        fetch_all(&mut *self.tx, None).await
    }

    pub async fn get_all_by_index<R: Record>(
        &mut self,
        index: Index,
        value: &str,
    ) -> Result<Vec<R>, StorageError> {
        check_index::<R>(index)?;
        fetch_all(&mut *self.tx, Some((index, value))).await
    }

    pub async fn delete<R: Record>(&mut self, key: &str) -> Result<bool, StorageError> {
        let removed = delete_where(&mut *self.tx, R::COLLECTION, "id", key).await?;
        Ok(removed > 0)
    }

    pub async fn delete_by_index<R: Record>(
        &mut self,
        index: Index,
        value: &str,
    ) -> Result<u64, StorageError> {
        check_index::<R>(index)?;
        delete_where(&mut *self.tx, R::COLLECTION, index.column(), value).await
    }

    pub async fn clear<R: Record>(&mut self) -> Result<u64, StorageError> {
        clear_table(&mut *self.tx, R::COLLECTION).await
    }

    pub async fn commit(self) -> Result<(), StorageError> {
        self.tx.commit().await?;
        Ok(())
    }
}
