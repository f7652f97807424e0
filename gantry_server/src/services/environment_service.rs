//! Environment registry: resolves repository enrollments.

use std::sync::Arc;

use crate::errors::Error;
use crate::models::environment::Environment;
use crate::repo::EnvironmentStore;

/// Read-only lookup of enrolled repositories. The resolved Environment
/// carries the installation id that selects GitHub credentials downstream.
pub struct EnvironmentRegistry {
    store: Arc<dyn EnvironmentStore>,
}

impl EnvironmentRegistry {
    pub fn new(store: Arc<dyn EnvironmentStore>) -> Self {
        EnvironmentRegistry { store }
    }

    /// Resolve one enrollment. `NotFound` is a terminal client-class
    /// condition for the caller.
    pub async fn resolve(
        &self,
        project_id: i64,
        cluster_id: i64,
        installation_id: i64,
        owner: &str,
        name: &str,
    ) -> Result<Environment, Error> {
        self.store
            .read_environment(project_id, cluster_id, installation_id, owner, name)
            .await
    }

    /// Every enrollment of a repository under an installation. Webhook
    /// dispatch fans out over these.
    pub async fn for_repo(
        &self,
        installation_id: i64,
        owner: &str,
        name: &str,
    ) -> Result<Vec<Environment>, Error> {
        self.store
            .list_environments_for_repo(installation_id, owner, name)
            .await
    }
}
