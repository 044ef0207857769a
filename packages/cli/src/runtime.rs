// ABOUTME: Wires configuration, the entity store and the cluster adapter together
// ABOUTME: Also resolves user-supplied container references (id, id prefix or name)

use anyhow::{anyhow, bail, Context, Result};
use kubedock_cluster::{AdapterConfig, ClusterAdapter, KubeClient};
use kubedock_config::Config;
use kubedock_storage::{Container, EntityStore};
use std::sync::Arc;

pub struct Runtime {
    pub config: Config,
    pub store: EntityStore,
}

impl Runtime {
    /// Open (and if needed create) the entity store named by the configuration.
    pub async fn open(config: Config) -> Result<Self> {
        let store = EntityStore::open(&config.database_url)
            .await
            .with_context(|| format!("Failed to open entity store at {}", config.database_url))?;
        Ok(Self { config, store })
    }

    /// Connect to the cluster. Only commands that touch pods pay for this.
    pub async fn adapter(&self) -> Result<ClusterAdapter> {
        let client = KubeClient::connect(&self.config.namespace)
            .await
            .context("Failed to connect to the Kubernetes cluster")?;
        Ok(ClusterAdapter::new(
            Arc::new(client),
            AdapterConfig::from(&self.config),
        ))
    }

    /// Record the stop, remove the pod and then drop the container record.
    /// A failed pod removal leaves the record in the Stopped phase.
    pub async fn remove_container(
        &self,
        adapter: &ClusterAdapter,
        container: &Container,
    ) -> Result<()> {
        let stopped = self.store.signal_stop(&container.id).await?;
        adapter
            .delete(&stopped)
            .await
            .with_context(|| format!("Failed to remove pod of {}", container.short_id()))?;
        self.store.delete_container(&container.id).await?;
        Ok(())
    }

    pub async fn resolve_container(&self, reference: &str) -> Result<Container> {
        match self.store.get_container(reference).await {
            Ok(container) => return Ok(container),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        let containers = self.store.list_containers().await?;
        match_container(&containers, reference).cloned()
    }
}

/// Find the single container whose name equals `reference` or whose id
/// starts with it.
pub fn match_container<'a>(containers: &'a [Container], reference: &str) -> Result<&'a Container> {
    if reference.is_empty() {
        bail!("Container reference is empty");
    }
    if let Some(named) = containers.iter().find(|c| c.name == reference) {
        return Ok(named);
    }

    let mut matches = containers.iter().filter(|c| c.id.starts_with(reference));
    match (matches.next(), matches.next()) {
        (Some(container), None) => Ok(container),
        (Some(_), Some(_)) => bail!("Container reference '{}' is ambiguous", reference),
        (None, _) => Err(anyhow!("No such container: {}", reference)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubedock_cluster::test_utils::FakeCluster;
    use kubedock_storage::ContainerPhase;
    use rstest::rstest;
    use std::time::Duration;

    fn containers() -> Vec<Container> {
        [("a1b2c3", "web"), ("a1ffff", "db"), ("9e8d7c", "")]
            .iter()
            .map(|(id, name)| {
                let mut container = Container::new("busybox");
                container.id = id.to_string();
                container.name = name.to_string();
                container
            })
            .collect()
    }

    #[rstest]
    #[case("web", "a1b2c3")]
    #[case("a1b", "a1b2c3")]
    #[case("9e", "9e8d7c")]
    #[case("db", "a1ffff")]
    fn test_match_container(#[case] reference: &str, #[case] expected: &str) {
        let containers = containers();
        assert_eq!(match_container(&containers, reference).unwrap().id, expected);
    }

    #[rstest]
    #[case("a1")]
    #[case("zz")]
    #[case("")]
    fn test_match_container_failures(#[case] reference: &str) {
        let containers = containers();
        assert!(match_container(&containers, reference).is_err());
    }

    #[tokio::test]
    async fn test_remove_container_records_stop_first() {
        let runtime = Runtime {
            config: Config::default(),
            store: EntityStore::in_memory().await.unwrap(),
        };
        let fake = FakeCluster::new();
        let adapter = ClusterAdapter::new(
            Arc::new(fake.clone()),
            AdapterConfig {
                poll_interval: Duration::from_millis(5),
                ..AdapterConfig::default()
            },
        );

        let mut container = runtime
            .store
            .create_container(Container::new("busybox"))
            .await
            .unwrap();
        adapter.start(&mut container).await.unwrap();
        runtime.store.update_container(&container).await.unwrap();

        fake.set_unavailable(true);
        assert!(runtime.remove_container(&adapter, &container).await.is_err());
        let kept = runtime.store.get_container(&container.id).await.unwrap();
        assert_eq!(kept.phase, ContainerPhase::Stopped);

        fake.set_unavailable(false);
        runtime.remove_container(&adapter, &kept).await.unwrap();
        assert!(runtime
            .store
            .get_container(&container.id)
            .await
            .unwrap_err()
            .is_not_found());
        assert_eq!(fake.pod_count(), 0);
    }

    #[tokio::test]
    async fn test_open_creates_store_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubedock.db");
        let config = Config {
            database_url: format!("sqlite://{}", path.display()),
            ..Config::default()
        };

        let runtime = Runtime::open(config).await.unwrap();
        assert!(path.exists());
        assert_eq!(runtime.store.list_networks().await.unwrap().len(), 1);

        let mut requested = Container::new("busybox");
        requested.name = "worker".to_string();
        let created = runtime.store.create_container(requested).await.unwrap();
        let resolved = runtime.resolve_container("worker").await.unwrap();
        assert_eq!(resolved.id, created.id);
        let resolved = runtime.resolve_container(&created.id[..8]).await.unwrap();
        assert_eq!(resolved.id, created.id);
    }
}
