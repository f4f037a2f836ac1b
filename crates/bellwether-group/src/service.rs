//! Cluster service over a coordination client.

use std::sync::Arc;

use bellwether_cluster::Cluster;
use bellwether_cluster::ClusterError;
use bellwether_cluster::ClusterResult;
use bellwether_cluster::ClusterServiceSupport;
use bellwether_cluster::ClusterView;
use bellwether_cluster::ClusterViewFactory;
use tracing::debug;

use crate::client::CoordinationClient;
use crate::config::ConfigError;
use crate::config::GroupConfig;
use crate::view::GroupClusterView;

/// Builds one [`GroupClusterView`] per namespace, all sharing one client
/// session.
pub struct GroupViewFactory {
    client: Arc<dyn CoordinationClient>,
    config: GroupConfig,
    local_member_id: String,
}

impl GroupViewFactory {
    /// Validate `config` and `local_member_id` and build the factory.
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        config: GroupConfig,
        local_member_id: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let local_member_id = local_member_id.into();
        if local_member_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "member_id".into(),
                value: local_member_id,
                reason: "must not be empty".into(),
            });
        }
        Ok(Self {
            client,
            config,
            local_member_id,
        })
    }

    /// The shared coordination client.
    pub fn client(&self) -> &Arc<dyn CoordinationClient> {
        &self.client
    }

    /// Configuration the views are built with.
    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    /// Id this process publishes in every group.
    pub fn local_member_id(&self) -> &str {
        &self.local_member_id
    }
}

impl ClusterViewFactory for GroupViewFactory {
    fn create_view(&self, cluster: &Cluster, namespace: &str) -> ClusterResult<Arc<dyn ClusterView>> {
        debug!(cluster = %cluster, namespace, "building group cluster view");
        let view = GroupClusterView::new(
            Arc::clone(&self.client),
            &self.config,
            cluster.clone(),
            namespace,
            &self.local_member_id,
        )
        .map_err(|e| ClusterError::view_creation(namespace, e))?;
        Ok(view)
    }
}

/// A cluster service whose views are coordination-service groups.
pub type GroupClusterService = ClusterServiceSupport<GroupViewFactory>;

/// Build a [`GroupClusterService`] for `cluster`.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidValue`] for an invalid configuration or an
/// empty member id.
pub fn group_cluster_service(
    cluster: Cluster,
    client: Arc<dyn CoordinationClient>,
    config: GroupConfig,
    local_member_id: impl Into<String>,
) -> Result<GroupClusterService, ConfigError> {
    let factory = GroupViewFactory::new(client, config, local_member_id)?;
    Ok(ClusterServiceSupport::new(cluster, factory))
}
