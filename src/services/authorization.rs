//! Authorization collaborator: may this owner upload for this collection and purpose?

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::{
    errors::UploadResult,
    models::upload::{OwnerKey, Purpose},
};

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn is_authorized(
        &self,
        owner: &OwnerKey,
        collection_id: Option<&str>,
        purpose: Purpose,
    ) -> UploadResult<bool>;
}

/// Membership-based checks against `collection_members`.
///
/// Clips are shared into a collection and need a signed-in member of it.
/// Compression and cutting are personal tools open to anyone.
#[derive(Clone)]
pub struct SqliteAuthorizer {
    db: Arc<SqlitePool>,
}

impl SqliteAuthorizer {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Authorizer for SqliteAuthorizer {
    async fn is_authorized(
        &self,
        owner: &OwnerKey,
        collection_id: Option<&str>,
        purpose: Purpose,
    ) -> UploadResult<bool> {
        match purpose {
            Purpose::Compress | Purpose::Cut => Ok(true),
            Purpose::Clip => {
                let Some(collection_id) = collection_id else {
                    return Ok(false);
                };
                if owner.is_anonymous() {
                    return Ok(false);
                }
                let member: Option<i64> = sqlx::query_scalar(
                    "SELECT 1 FROM collection_members WHERE collection_id = ? AND user_id = ?",
                )
                .bind(collection_id)
                .bind(owner.as_str())
                .fetch_optional(&*self.db)
                .await?;
                Ok(member.is_some())
            }
        }
    }
}
