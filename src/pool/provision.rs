//! Creating, replacing and tearing down the pool's sandboxes across the
//! configured provider hosts.

use chrono::Utc;
use futures::future::join_all;
use uuid::Uuid;

use crate::sandbox::{
    ContainerSummary, ControlClient, ProviderEndpoint, SandboxConfig, SandboxError, SandboxHandle,
};

use super::SlotId;

#[derive(Debug, Clone)]
pub struct Provisioner {
    clients: Vec<ControlClient>,
    template: SandboxConfig,
    prefix: String,
}

impl Provisioner {
    pub fn new(clients: Vec<ControlClient>, template: SandboxConfig, prefix: impl Into<String>) -> Self {
        Self {
            clients,
            template,
            prefix: prefix.into(),
        }
    }

    /// `{prefix}-{slot}-{8 hex chars}`; unique per incarnation of a slot.
    pub fn sandbox_name(&self, slot: SlotId) -> String {
        let id = Uuid::new_v4().simple().to_string();
        format!("{}-{}-{}", self.prefix, slot, &id[..8])
    }

    fn owns(&self, name: &str) -> bool {
        name.strip_prefix(&self.prefix)
            .is_some_and(|rest| rest.starts_with('-'))
    }

    fn client_for(&self, endpoint: &ProviderEndpoint) -> Result<&ControlClient, SandboxError> {
        self.clients
            .iter()
            .find(|c| c.endpoint() == endpoint)
            .ok_or_else(|| SandboxError::Backend(format!("no client for provider {endpoint}")))
    }

    /// Create `size` sandboxes concurrently, slot `i` on host `i % hosts`.
    /// Slots whose sandbox could not be created come back as `None`.
    pub async fn provision(&self, size: usize) -> Vec<Option<SandboxHandle>> {
        if self.clients.is_empty() {
            return vec![None; size];
        }

        let creates = (0..size).map(|slot| {
            let client = &self.clients[slot % self.clients.len()];
            let mut config = self.template.clone();
            config.name = self.sandbox_name(slot);
            async move {
                match client.create(&config).await {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        tracing::error!(slot, provider = %client.endpoint(), error = %e, "failed to provision sandbox");
                        None
                    }
                }
            }
        });
        let handles = join_all(creates).await;

        let live = handles.iter().filter(|h| h.is_some()).count();
        tracing::info!(live, requested = size, "pool provisioned");
        handles
    }

    /// Create a fresh sandbox for `slot`. With `old`, that sandbox is
    /// destroyed first and the new one goes to the same provider with the
    /// same config; without it, the slot is filled like at startup.
    pub async fn replace(
        &self,
        slot: SlotId,
        old: Option<&SandboxHandle>,
    ) -> Result<SandboxHandle, SandboxError> {
        let (client, mut config) = match old {
            Some(old) => {
                let client = self.client_for(old.provider())?;
                let age = Utc::now().signed_duration_since(old.created_at());
                tracing::info!(slot, sandbox = %old.name(), age_secs = age.num_seconds(), "destroying sandbox");
                client.destroy(old.name()).await;
                (client, old.config().clone())
            }
            None => {
                if self.clients.is_empty() {
                    return Err(SandboxError::Provision("no provider hosts configured".into()));
                }
                (&self.clients[slot % self.clients.len()], self.template.clone())
            }
        };

        config.name = self.sandbox_name(slot);
        let handle = client.create(&config).await?;
        tracing::info!(
            slot,
            old = ?old.map(SandboxHandle::name),
            new = %handle.name(),
            "sandbox provisioned for slot"
        );
        Ok(handle)
    }

    /// Containers on every provider. Providers that fail to answer are
    /// logged and skipped.
    pub async fn list_all(&self) -> Vec<ContainerSummary> {
        let lists = join_all(self.clients.iter().map(|c| async move { (c, c.list().await) })).await;
        let mut all = Vec::new();
        for (client, result) in lists {
            match result {
                Ok(containers) => all.extend(containers),
                Err(e) => {
                    tracing::warn!(provider = %client.endpoint(), error = %e, "failed to list containers");
                }
            }
        }
        all
    }

    /// Destroy containers left behind by an earlier run of this pool.
    /// Returns how many were destroyed.
    pub async fn cleanup_orphans(&self) -> usize {
        let orphans: Vec<ContainerSummary> = self
            .list_all()
            .await
            .into_iter()
            .filter(|c| self.owns(&c.name))
            .collect();

        let destroys = orphans.iter().filter_map(|orphan| {
            let client = self.client_for(&orphan.provider).ok()?;
            Some(async move {
                tracing::info!(provider = %orphan.provider, name = %orphan.name, "destroying orphaned sandbox");
                client.destroy(&orphan.name).await;
            })
        });
        let destroyed = join_all(destroys).await.len();
        if destroyed > 0 {
            tracing::info!(destroyed, "cleaned up orphaned sandboxes");
        }
        destroyed
    }

    /// Best-effort teardown of `handles`.
    pub async fn destroy_all(&self, handles: Vec<SandboxHandle>) {
        let destroys = handles.iter().map(|handle| async move {
            match self.client_for(handle.provider()) {
                Ok(client) => client.destroy(handle.name()).await,
                Err(e) => tracing::warn!(name = %handle.name(), error = %e, "cannot destroy sandbox"),
            }
        });
        join_all(destroys).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::sandbox::RetryPolicy;

    const CREATED: &str = r#"{"status":"success","connection_info":"127.0.0.1:5000:9222:8006:8080"}"#;

    fn template() -> SandboxConfig {
        SandboxConfig {
            name: String::new(),
            os_type: "ubuntu".into(),
            screen_width: 1280,
            screen_height: 720,
            disk_size: "32G".into(),
            ram_size: "4G".into(),
            cpu_cores: 2,
            headless: true,
        }
    }

    fn client_for(server: &mockito::ServerGuard) -> ControlClient {
        let endpoint: ProviderEndpoint = server.host_with_port().parse().unwrap();
        let retry = RetryPolicy {
            max_attempts: 2,
            base_backoff: Duration::from_millis(1),
        };
        ControlClient::new(endpoint, retry, Some(Duration::from_secs(5))).unwrap()
    }

    #[test]
    fn names_carry_prefix_and_slot() {
        let p = Provisioner::new(Vec::new(), template(), "envpool");
        let name = p.sandbox_name(3);
        assert!(name.starts_with("envpool-3-"));
        assert_eq!(name.len(), "envpool-3-".len() + 8);
        assert_ne!(name, p.sandbox_name(3));

        assert!(p.owns("envpool-0-deadbeef"));
        assert!(!p.owns("envpoolx-0"));
        assert!(!p.owns("other-envpool-0"));
    }

    #[tokio::test]
    async fn provision_spreads_slots_over_hosts() {
        let mut a = mockito::Server::new_async().await;
        let mut b = mockito::Server::new_async().await;
        let on_a = a
            .mock("POST", "/start_container")
            .with_status(200)
            .with_body(CREATED)
            .expect(2)
            .create_async()
            .await;
        let on_b = b
            .mock("POST", "/start_container")
            .with_status(200)
            .with_body(CREATED)
            .expect(1)
            .create_async()
            .await;

        let p = Provisioner::new(vec![client_for(&a), client_for(&b)], template(), "envpool");
        let handles = p.provision(3).await;
        assert!(handles.iter().all(Option::is_some));
        assert!(handles[0].as_ref().unwrap().name().starts_with("envpool-0-"));
        assert!(handles[2].as_ref().unwrap().name().starts_with("envpool-2-"));
        on_a.assert_async().await;
        on_b.assert_async().await;
    }

    #[tokio::test]
    async fn failed_creates_leave_empty_slots() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/start_container")
            .with_status(400)
            .with_body("bad config")
            .create_async()
            .await;

        let p = Provisioner::new(vec![client_for(&server)], template(), "envpool");
        let handles = p.provision(2).await;
        assert_eq!(handles.len(), 2);
        assert!(handles.iter().all(Option::is_none));
    }

    #[tokio::test]
    async fn cleanup_destroys_only_own_containers() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/list")
            .with_status(200)
            .with_body(r#"{"containers":["envpool-0-aaaa1111","someone-else",{"name":"envpool-1-bbbb2222","status":"running"}]}"#)
            .create_async()
            .await;
        let own_a = server
            .mock("POST", "/stop_container/envpool-0-aaaa1111")
            .with_status(200)
            .with_body(r#"{"status":"success"}"#)
            .create_async()
            .await;
        let own_b = server
            .mock("POST", "/stop_container/envpool-1-bbbb2222")
            .with_status(200)
            .with_body(r#"{"status":"success"}"#)
            .create_async()
            .await;
        let foreign = server
            .mock("POST", "/stop_container/someone-else")
            .expect(0)
            .create_async()
            .await;

        let p = Provisioner::new(vec![client_for(&server)], template(), "envpool");
        assert_eq!(p.cleanup_orphans().await, 2);
        own_a.assert_async().await;
        own_b.assert_async().await;
        foreign.assert_async().await;
    }

    #[tokio::test]
    async fn replace_destroys_then_creates() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/start_container")
            .with_status(200)
            .with_body(CREATED)
            .expect(2)
            .create_async()
            .await;

        let p = Provisioner::new(vec![client_for(&server)], template(), "envpool");
        let old = p.provision(1).await.remove(0).unwrap();
        let stop = server
            .mock("POST", format!("/stop_container/{}", old.name()).as_str())
            .with_status(200)
            .with_body(r#"{"status":"success"}"#)
            .create_async()
            .await;

        let new = p.replace(0, Some(&old)).await.unwrap();
        assert_ne!(new.name(), old.name());
        assert!(new.name().starts_with("envpool-0-"));
        stop.assert_async().await;
    }

    #[tokio::test]
    async fn replace_fills_an_empty_slot_on_its_host() {
        let mut a = mockito::Server::new_async().await;
        let mut b = mockito::Server::new_async().await;
        let on_a = a
            .mock("POST", "/start_container")
            .expect(0)
            .create_async()
            .await;
        let on_b = b
            .mock("POST", "/start_container")
            .with_status(200)
            .with_body(CREATED)
            .expect(1)
            .create_async()
            .await;

        let p = Provisioner::new(vec![client_for(&a), client_for(&b)], template(), "envpool");
        let handle = p.replace(1, None).await.unwrap();
        assert!(handle.name().starts_with("envpool-1-"));
        assert_eq!(handle.config().os_type, "ubuntu");
        on_a.assert_async().await;
        on_b.assert_async().await;
    }

    #[tokio::test]
    async fn replace_without_hosts_fails() {
        let p = Provisioner::new(Vec::new(), template(), "envpool");
        let err = p.replace(0, None).await.unwrap_err();
        assert!(matches!(err, SandboxError::Provision(_)));
    }
}
