// ABOUTME: SQLite-backed store for containers, networks, images and memberships
// ABOUTME: Runs migrations, seeds the bridge network and retries identifier collisions

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::ids::generate_id;
use crate::types::{Container, ContainerPhase, Image, Network, DEFAULT_NETWORK};
use crate::{Result, StorageError};

const MAX_ID_ATTEMPTS: usize = 16;

const CONTAINER_COLUMNS: &str = "id, name, image, command, env, exposed_ports, labels, binds, \
     mapped_ports, phase, created_at, started_at, stopped_at";

#[derive(Clone)]
pub struct EntityStore {
    pool: SqlitePool,
}

impl EntityStore {
    /// Open (creating if missing) the database at `url`.
    pub async fn open(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        info!("Opened entity store at {}", url);
        Self::with_pool(pool).await
    }

    /// A private in-memory database. The pool is pinned to one connection
    /// that never expires, since closing it would discard the data.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Wrap an existing pool, applying migrations and seeding the bridge network.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        let store = Self { pool };
        store.seed_default_network().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn seed_default_network(&self) -> Result<()> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO networks (id, name, created_at) VALUES (?1, ?2, ?3)",
        )
        .bind(generate_id())
        .bind(DEFAULT_NETWORK)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            info!("Seeded default network '{}'", DEFAULT_NETWORK);
        }
        Ok(())
    }

    // ========================================================================
    // CONTAINER OPERATIONS
    // ========================================================================

    /// Insert a new container under a freshly generated id. A container with
    /// no networks joins the bridge network.
    pub async fn create_container(&self, mut container: Container) -> Result<Container> {
        if container.networks.is_empty() {
            let bridge = self.get_network_by_name(DEFAULT_NETWORK).await?;
            container.networks.insert(bridge.id);
        }

        let command = serde_json::to_string(&container.command)?;
        let env = serde_json::to_string(&container.env)?;
        let exposed_ports = serde_json::to_string(&container.exposed_ports)?;
        let labels = serde_json::to_string(&container.labels)?;
        let binds = serde_json::to_string(&container.binds)?;
        let mapped_ports = serde_json::to_string(&container.mapped_ports)?;

        for _ in 0..MAX_ID_ATTEMPTS {
            let id = generate_id();
            let mut tx = self.pool.begin().await?;

            let inserted = sqlx::query(
                r#"
                INSERT INTO containers (
                    id, name, image, command, env, exposed_ports, labels, binds,
                    mapped_ports, phase, created_at, started_at, stopped_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
            )
            .bind(&id)
            .bind(&container.name)
            .bind(&container.image)
            .bind(&command)
            .bind(&env)
            .bind(&exposed_ports)
            .bind(&labels)
            .bind(&binds)
            .bind(&mapped_ports)
            .bind(container.phase.as_str())
            .bind(container.created_at.to_rfc3339())
            .bind(container.started_at.map(|d| d.to_rfc3339()))
            .bind(container.stopped_at.map(|d| d.to_rfc3339()))
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(_) => {}
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                    debug!("Container id collision on {}, regenerating", id);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            for network_id in &container.networks {
                let joined = sqlx::query(
                    "INSERT OR IGNORE INTO network_memberships (network_id, container_id, created_at)
                     VALUES (?1, ?2, ?3)",
                )
                .bind(network_id)
                .bind(&id)
                .bind(Utc::now().to_rfc3339())
                .execute(&mut *tx)
                .await;

                if let Err(sqlx::Error::Database(e)) = &joined {
                    if e.is_foreign_key_violation() {
                        return Err(StorageError::not_found("network", network_id.clone()));
                    }
                }
                joined?;
            }

            tx.commit().await?;
            container.id = id;
            debug!("Created container {} ({})", container.id, container.image);
            return Ok(container);
        }

        Err(StorageError::IdentifierExhausted(MAX_ID_ATTEMPTS))
    }

    pub async fn get_container(&self, id: &str) -> Result<Container> {
        let sql = format!("SELECT {} FROM containers WHERE id = ?1", CONTAINER_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Err(StorageError::not_found("container", id));
        };

        let mut container = row_to_container(&row)?;
        let networks: Vec<String> = sqlx::query_scalar(
            "SELECT network_id FROM network_memberships WHERE container_id = ?1",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        container.networks = networks.into_iter().collect();
        Ok(container)
    }

    pub async fn list_containers(&self) -> Result<Vec<Container>> {
        let sql = format!(
            "SELECT {} FROM containers ORDER BY created_at, id",
            CONTAINER_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let memberships = sqlx::query("SELECT network_id, container_id FROM network_memberships")
            .fetch_all(&self.pool)
            .await?;
        let mut by_container: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for row in memberships {
            let network_id: String = row.try_get("network_id")?;
            let container_id: String = row.try_get("container_id")?;
            by_container
                .entry(container_id)
                .or_default()
                .insert(network_id);
        }

        rows.iter()
            .map(|row| {
                let mut container = row_to_container(row)?;
                container.networks = by_container.remove(&container.id).unwrap_or_default();
                Ok(container)
            })
            .collect()
    }

    /// Containers carrying `key=value` among their labels.
    pub async fn find_containers_by_label(&self, key: &str, value: &str) -> Result<Vec<Container>> {
        let containers = self.list_containers().await?;
        Ok(containers
            .into_iter()
            .filter(|c| c.labels.get(key).map(String::as_str) == Some(value))
            .collect())
    }

    /// Persist every field of an existing container except its network
    /// memberships, which only change through connect/disconnect.
    pub async fn update_container(&self, container: &Container) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE containers SET
                name = ?2, image = ?3, command = ?4, env = ?5, exposed_ports = ?6,
                labels = ?7, binds = ?8, mapped_ports = ?9, phase = ?10,
                started_at = ?11, stopped_at = ?12
            WHERE id = ?1
            "#,
        )
        .bind(&container.id)
        .bind(&container.name)
        .bind(&container.image)
        .bind(serde_json::to_string(&container.command)?)
        .bind(serde_json::to_string(&container.env)?)
        .bind(serde_json::to_string(&container.exposed_ports)?)
        .bind(serde_json::to_string(&container.labels)?)
        .bind(serde_json::to_string(&container.binds)?)
        .bind(serde_json::to_string(&container.mapped_ports)?)
        .bind(container.phase.as_str())
        .bind(container.started_at.map(|d| d.to_rfc3339()))
        .bind(container.stopped_at.map(|d| d.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("container", container.id.clone()));
        }
        Ok(())
    }

    /// Record that a termination signal was sent to the container.
    pub async fn signal_stop(&self, id: &str) -> Result<Container> {
        let mut container = self.get_container(id).await?;
        container.signal_stop();
        self.update_container(&container).await?;
        Ok(container)
    }

    /// Remove the container record. Memberships go with it.
    pub async fn delete_container(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM containers WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("container", id));
        }
        debug!("Deleted container {}", id);
        Ok(())
    }

    // ========================================================================
    // NETWORK OPERATIONS
    // ========================================================================

    pub async fn create_network(&self, name: &str) -> Result<Network> {
        let created_at = Utc::now();

        for _ in 0..MAX_ID_ATTEMPTS {
            let id = generate_id();
            let inserted = sqlx::query(
                "INSERT INTO networks (id, name, created_at) VALUES (?1, ?2, ?3)",
            )
            .bind(&id)
            .bind(name)
            .bind(created_at.to_rfc3339())
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(_) => {
                    return Ok(Network {
                        id,
                        name: name.to_string(),
                        members: BTreeSet::new(),
                        created_at,
                    })
                }
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                    match self.get_network_by_name(name).await {
                        Ok(_) => {
                            return Err(StorageError::AlreadyExists {
                                entity: "network",
                                name: name.to_string(),
                            })
                        }
                        Err(StorageError::NotFound { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StorageError::IdentifierExhausted(MAX_ID_ATTEMPTS))
    }

    pub async fn get_network(&self, id: &str) -> Result<Network> {
        let row = sqlx::query("SELECT id, name, created_at FROM networks WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => self.hydrate_network(&row).await,
            None => Err(StorageError::not_found("network", id)),
        }
    }

    pub async fn get_network_by_name(&self, name: &str) -> Result<Network> {
        let row = sqlx::query("SELECT id, name, created_at FROM networks WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => self.hydrate_network(&row).await,
            None => Err(StorageError::not_found("network", name)),
        }
    }

    /// Networks whose ids appear in `ids`. Unknown ids are skipped.
    pub async fn get_networks_by_ids(&self, ids: &[String]) -> Result<Vec<Network>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id, name, created_at FROM networks WHERE id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(") ORDER BY name");

        let rows = query.build().fetch_all(&self.pool).await?;
        let mut networks = Vec::with_capacity(rows.len());
        for row in &rows {
            networks.push(self.hydrate_network(row).await?);
        }
        Ok(networks)
    }

    pub async fn list_networks(&self) -> Result<Vec<Network>> {
        let rows = sqlx::query("SELECT id, name, created_at FROM networks ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        let mut networks = Vec::with_capacity(rows.len());
        for row in &rows {
            networks.push(self.hydrate_network(row).await?);
        }
        Ok(networks)
    }

    /// Remove a network and its memberships. The bridge network stays.
    pub async fn delete_network(&self, id: &str) -> Result<()> {
        let network = self.get_network(id).await?;
        if network.is_default() {
            return Err(StorageError::Protected(network.name));
        }

        let result = sqlx::query("DELETE FROM networks WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("network", id));
        }
        Ok(())
    }

    /// Add a container to a network. Connecting twice leaves one membership.
    pub async fn connect_network(&self, network_id: &str, container_id: &str) -> Result<()> {
        self.ensure_membership_ends(network_id, container_id).await?;

        let result = sqlx::query(
            "INSERT OR IGNORE INTO network_memberships (network_id, container_id, created_at)
             VALUES (?1, ?2, ?3)",
        )
        .bind(network_id)
        .bind(container_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(
                "Container {} already connected to network {}",
                container_id, network_id
            );
        }
        Ok(())
    }

    /// Remove a container from a network. Disconnecting a non-member is a no-op.
    pub async fn disconnect_network(&self, network_id: &str, container_id: &str) -> Result<()> {
        self.ensure_membership_ends(network_id, container_id).await?;

        sqlx::query("DELETE FROM network_memberships WHERE network_id = ?1 AND container_id = ?2")
            .bind(network_id)
            .bind(container_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ensure_membership_ends(&self, network_id: &str, container_id: &str) -> Result<()> {
        let network: Option<i64> = sqlx::query_scalar("SELECT 1 FROM networks WHERE id = ?1")
            .bind(network_id)
            .fetch_optional(&self.pool)
            .await?;
        if network.is_none() {
            return Err(StorageError::not_found("network", network_id));
        }

        let container: Option<i64> = sqlx::query_scalar("SELECT 1 FROM containers WHERE id = ?1")
            .bind(container_id)
            .fetch_optional(&self.pool)
            .await?;
        if container.is_none() {
            return Err(StorageError::not_found("container", container_id));
        }
        Ok(())
    }

    async fn hydrate_network(&self, row: &SqliteRow) -> Result<Network> {
        let id: String = row.try_get("id")?;
        let members: Vec<String> = sqlx::query_scalar(
            "SELECT container_id FROM network_memberships WHERE network_id = ?1",
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Network {
            name: row.try_get("name")?,
            created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
            members: members.into_iter().collect(),
            id,
        })
    }

    // ========================================================================
    // IMAGE OPERATIONS
    // ========================================================================

    /// Record an image reference. Recording a known name returns the
    /// existing record.
    pub async fn create_image(&self, name: &str) -> Result<Image> {
        match self.get_image_by_name(name).await {
            Ok(image) => return Ok(image),
            Err(StorageError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let created_at = Utc::now();
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = generate_id();
            let inserted =
                sqlx::query("INSERT INTO images (id, name, created_at) VALUES (?1, ?2, ?3)")
                    .bind(&id)
                    .bind(name)
                    .bind(created_at.to_rfc3339())
                    .execute(&self.pool)
                    .await;

            match inserted {
                Ok(_) => {
                    return Ok(Image {
                        id,
                        name: name.to_string(),
                        created_at,
                    })
                }
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                    // Lost a race on the name, or collided on the id.
                    match self.get_image_by_name(name).await {
                        Ok(image) => return Ok(image),
                        Err(StorageError::NotFound { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StorageError::IdentifierExhausted(MAX_ID_ATTEMPTS))
    }

    pub async fn get_image(&self, id: &str) -> Result<Image> {
        let row = sqlx::query("SELECT id, name, created_at FROM images WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_image(&row),
            None => Err(StorageError::not_found("image", id)),
        }
    }

    pub async fn get_image_by_name(&self, name: &str) -> Result<Image> {
        let row = sqlx::query("SELECT id, name, created_at FROM images WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_image(&row),
            None => Err(StorageError::not_found("image", name)),
        }
    }

    pub async fn list_images(&self) -> Result<Vec<Image>> {
        let rows = sqlx::query("SELECT id, name, created_at FROM images ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_image).collect()
    }

    pub async fn delete_image(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM images WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("image", id));
        }
        Ok(())
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("bad timestamp '{}': {}", raw, e)))
}

fn parse_optional_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_timestamp).transpose()
}

fn row_to_container(row: &SqliteRow) -> Result<Container> {
    Ok(Container {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        image: row.try_get("image")?,
        command: serde_json::from_str(&row.try_get::<String, _>("command")?)?,
        env: serde_json::from_str(&row.try_get::<String, _>("env")?)?,
        exposed_ports: serde_json::from_str(&row.try_get::<String, _>("exposed_ports")?)?,
        labels: serde_json::from_str(&row.try_get::<String, _>("labels")?)?,
        binds: serde_json::from_str(&row.try_get::<String, _>("binds")?)?,
        networks: BTreeSet::new(),
        mapped_ports: serde_json::from_str(&row.try_get::<String, _>("mapped_ports")?)?,
        phase: ContainerPhase::from_str(&row.try_get::<String, _>("phase")?)?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        started_at: parse_optional_timestamp(row.try_get("started_at")?)?,
        stopped_at: parse_optional_timestamp(row.try_get("stopped_at")?)?,
    })
}

fn row_to_image(row: &SqliteRow) -> Result<Image> {
    Ok(Image {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::RESERVED_ID_PREFIX;
    use pretty_assertions::assert_eq;

    fn sample_container() -> Container {
        let mut container = Container::new("nginx:alpine");
        container.name = "web".to_string();
        container.command = vec!["nginx".to_string(), "-g".to_string()];
        container.env = Container::parse_env(["A=1", "B=two"]);
        container.exposed_ports = BTreeSet::from([80]);
        container.labels = BTreeMap::from([("app".to_string(), "web".to_string())]);
        container.binds = vec!["/tmp:/data".to_string()];
        container
    }

    #[tokio::test]
    async fn test_bridge_network_is_seeded_once() {
        let store = EntityStore::in_memory().await.unwrap();
        store.seed_default_network().await.unwrap();

        let networks = store.list_networks().await.unwrap();
        assert_eq!(networks.len(), 1);
        assert_eq!(networks[0].name, DEFAULT_NETWORK);
    }

    #[tokio::test]
    async fn test_create_and_get_container() {
        let store = EntityStore::in_memory().await.unwrap();
        let created = store.create_container(sample_container()).await.unwrap();

        assert_eq!(created.id.len(), 64);
        assert!(!created.id.starts_with(RESERVED_ID_PREFIX));

        let fetched = store.get_container(&created.id).await.unwrap();
        assert_eq!(fetched.image, "nginx:alpine");
        assert_eq!(fetched.command, created.command);
        assert_eq!(fetched.env, created.env);
        assert_eq!(fetched.exposed_ports, BTreeSet::from([80]));
        assert_eq!(fetched.phase, ContainerPhase::Created);

        let bridge = store.get_network_by_name(DEFAULT_NETWORK).await.unwrap();
        assert_eq!(fetched.networks, BTreeSet::from([bridge.id.clone()]));
        assert!(bridge.members.contains(&created.id));
    }

    #[tokio::test]
    async fn test_get_missing_container_is_not_found() {
        let store = EntityStore::in_memory().await.unwrap();
        let err = store.get_container("deadbeef").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!matches!(err, StorageError::Database(_)));
    }

    #[tokio::test]
    async fn test_explicit_network_skips_bridge() {
        let store = EntityStore::in_memory().await.unwrap();
        let net = store.create_network("isolated").await.unwrap();

        let mut container = sample_container();
        container.networks.insert(net.id.clone());
        let created = store.create_container(container).await.unwrap();

        let fetched = store.get_container(&created.id).await.unwrap();
        assert_eq!(fetched.networks, BTreeSet::from([net.id]));
    }

    #[tokio::test]
    async fn test_create_container_with_unknown_network() {
        let store = EntityStore::in_memory().await.unwrap();
        let mut container = sample_container();
        container.networks.insert("nope".to_string());

        let err = store.create_container(container).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.list_containers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_and_signal_stop() {
        let store = EntityStore::in_memory().await.unwrap();
        let mut container = store.create_container(sample_container()).await.unwrap();

        container.mark_running(&BTreeMap::from([(30080, 80)]));
        store.update_container(&container).await.unwrap();

        let fetched = store.get_container(&container.id).await.unwrap();
        assert_eq!(fetched.phase, ContainerPhase::Running);
        assert_eq!(fetched.mapped_ports, BTreeMap::from([(30080, 80)]));
        assert!(fetched.started_at.is_some());

        let stopped = store.signal_stop(&container.id).await.unwrap();
        assert_eq!(stopped.phase, ContainerPhase::Stopped);
        assert_eq!(
            store.get_container(&container.id).await.unwrap().phase,
            ContainerPhase::Stopped
        );
    }

    #[tokio::test]
    async fn test_update_missing_container() {
        let store = EntityStore::in_memory().await.unwrap();
        let mut container = sample_container();
        container.id = "0123".to_string();
        assert!(store
            .update_container(&container)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_delete_container_drops_memberships() {
        let store = EntityStore::in_memory().await.unwrap();
        let created = store.create_container(sample_container()).await.unwrap();

        store.delete_container(&created.id).await.unwrap();
        assert!(store
            .get_container(&created.id)
            .await
            .unwrap_err()
            .is_not_found());

        let bridge = store.get_network_by_name(DEFAULT_NETWORK).await.unwrap();
        assert!(bridge.members.is_empty());

        assert!(store
            .delete_container(&created.id)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_connect_network_twice_keeps_one_membership() {
        let store = EntityStore::in_memory().await.unwrap();
        let container = store.create_container(sample_container()).await.unwrap();
        let net = store.create_network("backend").await.unwrap();

        store.connect_network(&net.id, &container.id).await.unwrap();
        store.connect_network(&net.id, &container.id).await.unwrap();

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM network_memberships WHERE network_id = ?1 AND container_id = ?2",
        )
        .bind(&net.id)
        .bind(&container.id)
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(count, 1);

        let net = store.get_network(&net.id).await.unwrap();
        assert_eq!(net.members, BTreeSet::from([container.id.clone()]));

        store.disconnect_network(&net.id, &container.id).await.unwrap();
        store.disconnect_network(&net.id, &container.id).await.unwrap();
        assert!(store.get_network(&net.id).await.unwrap().members.is_empty());
    }

    #[tokio::test]
    async fn test_connect_requires_both_ends() {
        let store = EntityStore::in_memory().await.unwrap();
        let container = store.create_container(sample_container()).await.unwrap();
        let net = store.create_network("backend").await.unwrap();

        assert!(store
            .connect_network("missing", &container.id)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(store
            .connect_network(&net.id, "missing")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_networks_by_ids_skips_unknown() {
        let store = EntityStore::in_memory().await.unwrap();
        let a = store.create_network("a").await.unwrap();
        let b = store.create_network("b").await.unwrap();
        store.create_network("c").await.unwrap();

        let found = store
            .get_networks_by_ids(&[b.id.clone(), "ghost".to_string(), a.id.clone()])
            .await
            .unwrap();
        let names: Vec<_> = found.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        assert!(store.get_networks_by_ids(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_network_name() {
        let store = EntityStore::in_memory().await.unwrap();
        store.create_network("dup").await.unwrap();
        let err = store.create_network("dup").await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_bridge_cannot_be_deleted() {
        let store = EntityStore::in_memory().await.unwrap();
        let bridge = store.get_network_by_name(DEFAULT_NETWORK).await.unwrap();
        let err = store.delete_network(&bridge.id).await.unwrap_err();
        assert!(matches!(err, StorageError::Protected(_)));

        let other = store.create_network("tmp").await.unwrap();
        let container = store.create_container(sample_container()).await.unwrap();
        store.connect_network(&other.id, &container.id).await.unwrap();
        store.delete_network(&other.id).await.unwrap();

        let fetched = store.get_container(&container.id).await.unwrap();
        assert!(!fetched.networks.contains(&other.id));
    }

    #[tokio::test]
    async fn test_find_containers_by_label() {
        let store = EntityStore::in_memory().await.unwrap();
        let web = store.create_container(sample_container()).await.unwrap();
        let mut other = sample_container();
        other.labels.insert("app".to_string(), "db".to_string());
        store.create_container(other).await.unwrap();

        let found = store.find_containers_by_label("app", "web").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, web.id);
    }

    #[tokio::test]
    async fn test_images() {
        let store = EntityStore::in_memory().await.unwrap();
        let image = store.create_image("alpine:3.20").await.unwrap();
        let again = store.create_image("alpine:3.20").await.unwrap();
        assert_eq!(image.id, again.id);

        store.create_image("busybox").await.unwrap();
        let names: Vec<_> = store
            .list_images()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["alpine:3.20", "busybox"]);

        assert_eq!(store.get_image(&image.id).await.unwrap().name, "alpine:3.20");
        store.delete_image(&image.id).await.unwrap();
        assert!(store
            .get_image_by_name("alpine:3.20")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_corrupt_timestamp_is_reported() {
        let store = EntityStore::in_memory().await.unwrap();
        let created = store.create_container(sample_container()).await.unwrap();
        sqlx::query("UPDATE containers SET created_at = 'yesterday' WHERE id = ?1")
            .bind(&created.id)
            .execute(store.pool())
            .await
            .unwrap();

        let err = store.get_container(&created.id).await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt(_)));
    }
}
