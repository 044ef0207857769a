// ABOUTME: Durable entity store for kubedock containers, networks and images
// ABOUTME: SQLite-backed with migrations, identifier generation and network membership

pub mod ids;
pub mod store;
pub mod types;

use thiserror::Error;

pub use ids::{generate_id, RESERVED_ID_PREFIX};
pub use store::EntityStore;
pub use types::{Container, ContainerPhase, Image, Network, DEFAULT_NETWORK};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("{entity} already exists: {name}")]
    AlreadyExists { entity: &'static str, name: String },
    #[error("Invalid container phase: {0}")]
    InvalidPhase(String),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Corrupt record: {0}")]
    Corrupt(String),
    #[error("Network {0} cannot be removed")]
    Protected(String),
    #[error("Could not generate a free identifier after {0} attempts")]
    IdentifierExhausted(usize),
}

impl StorageError {
    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
