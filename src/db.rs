use crate::collab::QueueSnapshotStore;
use crate::{QueueItem, WorkerId};
use anyhow::Error;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Executor;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Queue snapshots in PostgreSQL, one row per queued item.
#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<PgPool>,
}

impl DbHandle {
    #[instrument(name = "db.new", skip_all)]
    pub async fn new(url: &str) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(DbHandle {
            pool: Arc::new(pool),
        })
    }
}

#[async_trait]
impl QueueSnapshotStore for DbHandle {
    #[instrument(name = "db.save_snapshot", skip_all, fields(worker = %worker, items = items.len()))]
    async fn save_snapshot(&self, worker: WorkerId, items: &[QueueItem]) -> Result<(), Error> {
        let worker_id = worker.0 as i32;
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM relayq_snapshot WHERE worker_id = $1")
            .bind(worker_id)
            .execute(&mut *tx)
            .await?;

        for (position, item) in items.iter().enumerate() {
            sqlx::query(
                "INSERT INTO relayq_snapshot (worker_id, position, item) \
                VALUES ($1, $2, $3)",
            )
            .bind(worker_id)
            .bind(position as i32)
            .bind(Json(item))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    #[instrument(name = "db.load_snapshot", skip_all, fields(worker = %worker))]
    async fn load_snapshot(&self, worker: WorkerId) -> Result<Vec<QueueItem>, Error> {
        let rows: Vec<(Json<QueueItem>,)> = sqlx::query_as(
            "SELECT item \
            FROM relayq_snapshot \
            WHERE worker_id = $1 \
            ORDER BY position asc",
        )
        .bind(worker.0 as i32)
        .fetch_all(&*self.pool)
        .await?;

        debug!("Loaded {} queued items", rows.len());
        Ok(rows.into_iter().map(|(Json(item),)| item).collect())
    }
}
