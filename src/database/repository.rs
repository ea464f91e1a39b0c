use crate::database::error::DatabaseError;
use async_trait::async_trait;
use sqlx::PgPool;

/// Common CRUD surface shared by the repositories.
#[async_trait]
pub trait Repository {
    type Entity;

    async fn find_by_id(&self, id: &str) -> Result<Option<Self::Entity>, DatabaseError>;

    async fn insert(&self, entity: &Self::Entity) -> Result<Self::Entity, DatabaseError>;

    async fn update(&self, id: &str, entity: &Self::Entity) -> Result<Self::Entity, DatabaseError>;

    async fn delete(&self, id: &str) -> Result<bool, DatabaseError>;
}

/// Repositories that expose their pool for multi-statement work.
pub trait TransactionalRepository {
    fn pool(&self) -> &PgPool;
}
