/// Video repository - database operations for the `videos` table
///
/// The worker performs exactly two operations: a single-row read by id and a
/// single-statement update of the processing state. The caller supplies the
/// target state; there is no read-modify-write.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::RepoError;
use crate::models::{Video, VideoStatus};

/// Target processing state written by `update_processing_state`
#[derive(Debug, Clone)]
pub struct VideoStateUpdate {
    pub id: Uuid,
    pub status: VideoStatus,
    pub processed_video_id: Option<Uuid>,
    pub processed_url: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl VideoStateUpdate {
    /// Compensating update: back to `uploaded` with all processed fields
    /// cleared.
    pub fn reset_to_uploaded(id: Uuid) -> Self {
        Self {
            id,
            status: VideoStatus::Uploaded,
            processed_video_id: None,
            processed_url: None,
            processed_at: None,
        }
    }

    pub fn processed(
        id: Uuid,
        processed_video_id: Uuid,
        processed_url: String,
        processed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            status: VideoStatus::Processed,
            processed_video_id: Some(processed_video_id),
            processed_url: Some(processed_url),
            processed_at: Some(processed_at),
        }
    }
}

#[async_trait]
pub trait VideoRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Video, RepoError>;
    async fn update_processing_state(&self, update: &VideoStateUpdate) -> Result<(), RepoError>;
}

pub struct PgVideoRepository {
    pool: PgPool,
}

impl PgVideoRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VideoRepository for PgVideoRepository {
    async fn find_by_id(&self, id: Uuid) -> Result<Video, RepoError> {
        let video = sqlx::query_as::<_, Video>(
            "SELECT id, owner_id, raw_video_id, processed_video_id, title, status,
                    uploaded_at, processed_at, original_url, processed_url, votes
             FROM videos
             WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RepoError::NotFound(id.to_string()))?;

        Ok(video)
    }

    async fn update_processing_state(&self, update: &VideoStateUpdate) -> Result<(), RepoError> {
        let result = sqlx::query(
            "UPDATE videos
             SET status = $2, processed_video_id = $3, processed_url = $4, processed_at = $5
             WHERE id = $1",
        )
        .bind(update.id)
        .bind(update.status)
        .bind(update.processed_video_id)
        .bind(update.processed_url.as_deref())
        .bind(update.processed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound(update.id.to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_every_processed_field() {
        let id = Uuid::new_v4();
        let update = VideoStateUpdate::reset_to_uploaded(id);
        assert_eq!(update.id, id);
        assert_eq!(update.status, VideoStatus::Uploaded);
        assert!(update.processed_video_id.is_none());
        assert!(update.processed_url.is_none());
        assert!(update.processed_at.is_none());
    }

    #[test]
    fn processed_sets_every_processed_field() {
        let id = Uuid::new_v4();
        let blob = Uuid::new_v4();
        let now = Utc::now();
        let update = VideoStateUpdate::processed(id, blob, format!("{blob}.mp4"), now);
        assert_eq!(update.status, VideoStatus::Processed);
        assert_eq!(update.processed_video_id, Some(blob));
        assert_eq!(update.processed_url, Some(format!("{blob}.mp4")));
        assert_eq!(update.processed_at, Some(now));
    }
}
