//! Error kinds surfaced by the database engine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("no context registered for gpu {uuid}")]
    GpuNotPresent { uuid: String },

    #[error("no such machine: {hostname}")]
    NoSuchMachine { hostname: String },

    #[error("file {filename} not present on {hostname}")]
    FileNotPresent { hostname: String, filename: String },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("transaction failed: {source}; rollback failed: {rollback}")]
    Transaction {
        #[source]
        source: Box<DbError>,
        rollback: sqlx::Error,
    },

    #[error("corrupt row in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },

    #[error("database file: {0}")]
    Io(#[from] std::io::Error),
}

impl DbError {
    pub fn gpu_not_present(uuid: impl Into<String>) -> Self {
        Self::GpuNotPresent { uuid: uuid.into() }
    }

    pub fn no_such_machine(hostname: impl Into<String>) -> Self {
        Self::NoSuchMachine {
            hostname: hostname.into(),
        }
    }

    pub fn file_not_present(hostname: impl Into<String>, filename: impl Into<String>) -> Self {
        Self::FileNotPresent {
            hostname: hostname.into(),
            filename: filename.into(),
        }
    }

    /// True for the lookup-miss kinds (GPU, machine, file).
    pub fn is_not_present(&self) -> bool {
        matches!(
            self,
            Self::GpuNotPresent { .. } | Self::NoSuchMachine { .. } | Self::FileNotPresent { .. }
        )
    }
}
