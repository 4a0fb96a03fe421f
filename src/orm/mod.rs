//! Object mapping on top of [`QueryExecutor`].
//!
//! A [`Model`] is stored as one row per instance: a UUID primary key and the
//! serialized model as a JSON document. [`Repository`] provides CRUD for one
//! model type and never touches the pool directly.

use crate::db::{Connect, QueryExecutor};
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, Row, Value};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;
use tracing::debug;
use uuid::Uuid;

/// A type stored by a [`Repository`].
pub trait Model: Serialize + DeserializeOwned + Send + Sync {
    /// Table holding the `(id, data)` rows. Used verbatim in SQL.
    fn table_name() -> &'static str;

    fn id(&self) -> Option<Uuid>;

    fn set_id(&mut self, id: Uuid);
}

/// CRUD operations for one [`Model`] type.
pub struct Repository<C: Connect, T: Model> {
    executor: QueryExecutor<C>,
    db_type: DatabaseType,
    _model: PhantomData<fn() -> T>,
}

impl<C: Connect, T: Model> Clone for Repository<C, T> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            db_type: self.db_type,
            _model: PhantomData,
        }
    }
}

impl<C: Connect, T: Model> fmt::Debug for Repository<C, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("table", &T::table_name())
            .field("db_type", &self.db_type)
            .finish()
    }
}

impl<C: Connect, T: Model> Repository<C, T> {
    /// `db_type` selects placeholder and column syntax.
    pub fn new(executor: QueryExecutor<C>, db_type: DatabaseType) -> Self {
        Self {
            executor,
            db_type,
            _model: PhantomData,
        }
    }

    pub fn executor(&self) -> &QueryExecutor<C> {
        &self.executor
    }

    /// Create the backing table if it does not exist.
    pub async fn ensure_table(&self) -> DbResult<()> {
        let (id_type, data_type) = match self.db_type {
            DatabaseType::PostgreSQL => ("UUID", "JSONB"),
            DatabaseType::MySQL => ("CHAR(36)", "JSON"),
            DatabaseType::SQLite => ("TEXT", "TEXT"),
        };
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (id {} PRIMARY KEY, data {} NOT NULL)",
            T::table_name(),
            id_type,
            data_type
        );
        self.executor.execute_statement(&sql).await?;
        Ok(())
    }

    /// Insert `model`, assigning an id if it has none.
    ///
    /// On return `model` holds the stored state.
    pub async fn create(&self, model: &mut T) -> DbResult<()> {
        let id = model.id().unwrap_or_else(Uuid::new_v4);
        model.set_id(id);
        let data = serde_json::to_value(&*model)?;

        let insert = format!(
            "INSERT INTO {} (id, data) VALUES ({}, {})",
            T::table_name(),
            self.db_type.placeholder(1),
            self.db_type.placeholder(2)
        );
        let params = [Value::Uuid(id), Value::Json(data)];

        let row = if self.db_type.supports_returning() {
            let sql = format!("{} RETURNING id, data", insert);
            self.executor.execute(&sql, &params).await?.into_iter().next()
        } else {
            self.executor.execute(&insert, &params).await?;
            self.select_row(id).await?
        };

        let row = row.ok_or_else(|| DbError::internal("Create returned no rows."))?;
        let (returned_id, stored) = decode_row::<T>(row)?;
        *model = stored;
        model.set_id(returned_id.unwrap_or(id));

        debug!(table = T::table_name(), id = %id, "Created record");
        Ok(())
    }

    /// Fetch a record by id.
    pub async fn find(&self, id: Uuid) -> DbResult<Option<T>> {
        match self.select_row(id).await? {
            Some(row) => {
                let (_, mut model) = decode_row::<T>(row)?;
                model.set_id(id);
                Ok(Some(model))
            }
            None => Ok(None),
        }
    }

    /// Fetch every record of the table, ordered by id.
    pub async fn all(&self) -> DbResult<Vec<T>> {
        let sql = format!("SELECT id, data FROM {} ORDER BY id", T::table_name());
        self.executor
            .execute(&sql, &[])
            .await?
            .into_iter()
            .map(|row| {
                let (id, mut model) = decode_row::<T>(row)?;
                if let Some(id) = id {
                    model.set_id(id);
                }
                Ok(model)
            })
            .collect()
    }

    /// Overwrite the stored document of an existing record.
    pub async fn update(&self, model: &T) -> DbResult<()> {
        let id = model
            .id()
            .ok_or_else(|| DbError::invalid_input("Missing id."))?;
        let data = serde_json::to_value(model)?;
        let sql = format!(
            "UPDATE {} SET data = {} WHERE id = {}",
            T::table_name(),
            self.db_type.placeholder(1),
            self.db_type.placeholder(2)
        );
        self.executor
            .execute(&sql, &[Value::Json(data), Value::Uuid(id)])
            .await?;
        debug!(table = T::table_name(), id = %id, "Updated record");
        Ok(())
    }

    /// Delete a record by id. Deleting a missing record is not an error.
    pub async fn delete(&self, id: Uuid) -> DbResult<()> {
        let sql = format!(
            "DELETE FROM {} WHERE id = {}",
            T::table_name(),
            self.db_type.placeholder(1)
        );
        self.executor.execute(&sql, &[Value::Uuid(id)]).await?;
        debug!(table = T::table_name(), id = %id, "Deleted record");
        Ok(())
    }

    async fn select_row(&self, id: Uuid) -> DbResult<Option<Row>> {
        let sql = format!(
            "SELECT id, data FROM {} WHERE id = {}",
            T::table_name(),
            self.db_type.placeholder(1)
        );
        Ok(self
            .executor
            .execute(&sql, &[Value::Uuid(id)])
            .await?
            .into_iter()
            .next())
    }
}

/// Split an `(id, data)` row into the id and the decoded model.
fn decode_row<T: Model>(row: Row) -> DbResult<(Option<Uuid>, T)> {
    let mut values = row.into_values().into_iter();
    let id = values.next().and_then(|v| v.as_uuid());
    let data = values
        .next()
        .ok_or_else(|| DbError::serialization("Record row has no data column"))?;
    if data.is_null() {
        return Err(DbError::serialization("Record data is NULL"));
    }
    let model = serde_json::from_value(data.into_json()?)?;
    Ok((id, model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ConnectionPool, SqlxConnector};
    use crate::models::ConnectionConfig;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: Option<Uuid>,
        title: String,
        tags: Vec<String>,
    }

    impl Model for Note {
        fn table_name() -> &'static str {
            "notes"
        }

        fn id(&self) -> Option<Uuid> {
            self.id
        }

        fn set_id(&mut self, id: Uuid) {
            self.id = Some(id);
        }
    }

    async fn repository() -> Repository<SqlxConnector, Note> {
        // One connection, so every call sees the same in-memory database.
        let pool =
            ConnectionPool::new(SqlxConnector::new(ConnectionConfig::sqlite(":memory:")), 1)
                .unwrap();
        let repo = Repository::new(QueryExecutor::new(pool), DatabaseType::SQLite);
        repo.ensure_table().await.unwrap();
        repo
    }

    fn note(title: &str) -> Note {
        Note {
            id: None,
            title: title.to_string(),
            tags: vec!["a".to_string()],
        }
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_find_returns_it() {
        let repo = repository().await;
        let mut first = note("first");
        repo.create(&mut first).await.unwrap();

        let id = first.id.unwrap();
        let found = repo.find(id).await.unwrap().unwrap();
        assert_eq!(found, first);
    }

    #[tokio::test]
    async fn test_create_keeps_existing_id() {
        let repo = repository().await;
        let id = Uuid::new_v4();
        let mut n = note("fixed");
        n.id = Some(id);
        repo.create(&mut n).await.unwrap();
        assert_eq!(n.id, Some(id));
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let repo = repository().await;
        let mut n = note("draft");
        repo.create(&mut n).await.unwrap();

        n.title = "final".to_string();
        repo.update(&n).await.unwrap();
        let found = repo.find(n.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(found.title, "final");

        repo.delete(n.id.unwrap()).await.unwrap();
        assert!(repo.find(n.id.unwrap()).await.unwrap().is_none());
        // Deleting again is fine.
        repo.delete(n.id.unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_without_id_is_invalid_input() {
        let repo = repository().await;
        let err = repo.update(&note("orphan")).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_find_missing_is_none() {
        let repo = repository().await;
        assert!(repo.find(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_all_lists_every_record() {
        let repo = repository().await;
        for title in ["x", "y", "z"] {
            repo.create(&mut note(title)).await.unwrap();
        }
        let mut titles: Vec<_> = repo.all().await.unwrap().into_iter().map(|n| n.title).collect();
        titles.sort();
        assert_eq!(titles, vec!["x", "y", "z"]);
    }

    #[test]
    fn test_decode_row_rejects_null_data() {
        let row = Row::new(
            vec!["id".to_string(), "data".to_string()].into(),
            vec![Value::Uuid(Uuid::new_v4()), Value::Null],
        );
        let err = decode_row::<Note>(row).unwrap_err();
        assert!(matches!(err, DbError::Serialization { .. }));
    }
}
