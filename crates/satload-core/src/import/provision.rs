use thiserror::Error;

use super::service::{CollectionAdmin, CollectionRef, ImportError};

/// Setup failure. Always fatal: without a collection there is nothing to
/// import into.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("Unable to {action} {target}: {source}")]
    Service {
        action: &'static str,
        target: String,
        #[source]
        source: ImportError,
    },
}

pub type ProvisioningResult<T> = Result<T, ProvisioningError>;

/// Where the run should land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionTarget {
    pub database: String,
    pub collection: String,
    pub throughput: u32,
}

impl CollectionTarget {
    fn describe(&self) -> String {
        format!("{}/{}", self.database, self.collection)
    }
}

/// Database and collection lifecycle around a run.
pub struct Provisioner<'a> {
    admin: &'a dyn CollectionAdmin,
}

impl<'a> Provisioner<'a> {
    pub fn new(admin: &'a dyn CollectionAdmin) -> Self {
        Self { admin }
    }

    /// Makes sure the target collection exists.
    ///
    /// With `clean_start` the database is dropped and recreated first.
    /// Otherwise an existing collection is reused and a missing one is
    /// created.
    pub async fn prepare(
        &self,
        target: &CollectionTarget,
        clean_start: bool,
    ) -> ProvisioningResult<CollectionRef> {
        if clean_start {
            self.drop_database_if_exists(&target.database).await?;
        } else if let Some(existing) = self
            .admin
            .get_collection(&target.database, &target.collection)
            .await
            .map_err(service("locate collection", target.describe()))?
        {
            tracing::info!(
                "Using existing collection {} ({} RU/s)",
                existing,
                existing.throughput
            );
            return Ok(existing);
        }

        let db_exists = self
            .admin
            .database_exists(&target.database)
            .await
            .map_err(service("locate database", target.database.clone()))?;
        if !db_exists {
            tracing::info!("Creating database {}", target.database);
            self.admin
                .create_database(&target.database)
                .await
                .map_err(service("create database", target.database.clone()))?;
        }

        tracing::info!(
            "Creating collection {} with {} RU/s",
            target.describe(),
            target.throughput
        );
        self.admin
            .create_collection(&target.database, &target.collection, target.throughput)
            .await
            .map_err(service("create collection", target.describe()))
    }

    pub async fn drop_database_if_exists(&self, database: &str) -> ProvisioningResult<bool> {
        let exists = self
            .admin
            .database_exists(database)
            .await
            .map_err(service("locate database", database.to_string()))?;
        if !exists {
            return Ok(false);
        }

        tracing::info!("Deleting database {}", database);
        self.admin
            .delete_database(database)
            .await
            .map_err(service("delete database", database.to_string()))?;
        Ok(true)
    }
}

fn service(action: &'static str, target: String) -> impl FnOnce(ImportError) -> ProvisioningError {
    move |source| ProvisioningError::Service {
        action,
        target,
        source,
    }
}
