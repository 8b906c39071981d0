use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

/// List envelope spoken by the mock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStyle {
    /// `{"servers": {"values": [...]}}`
    Legacy,
    /// `{"servers": [...]}`
    #[default]
    Current,
}

impl EnvelopeStyle {
    pub fn wrap(self, key: &str, items: Vec<Value>) -> Value {
        let list = Value::Array(items);
        match self {
            EnvelopeStyle::Legacy => json!({ key: { "values": list } }),
            EnvelopeStyle::Current => json!({ key: list }),
        }
    }

    /// Metadata objects are wrapped the same way as lists.
    pub fn wrap_metadata(self, metadata: &BTreeMap<String, String>) -> Value {
        let map: Map<String, Value> = metadata
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        match self {
            EnvelopeStyle::Legacy => json!({ "values": map }),
            EnvelopeStyle::Current => Value::Object(map),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MockOptions {
    pub envelope: EnvelopeStyle,
    /// Time a server spends in a transitional status.
    pub transition_delay: Duration,
    /// Required `X-Auth-Token`; `None` accepts every request.
    pub token: Option<String>,
    /// Seed the demo data set.
    pub seed: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            envelope: EnvelopeStyle::Current,
            transition_delay: Duration::from_secs(2),
            token: None,
            seed: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Server {
    pub id: u64,
    pub name: String,
    pub status: String,
    pub flavor: u64,
    pub image: u64,
    pub metadata: BTreeMap<String, String>,
    pub floating_ips: Vec<String>,
    pub firewall: BTreeMap<String, String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Server {
    pub fn to_json(&self, envelope: EnvelopeStyle) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "status": self.status,
            "flavor": { "id": self.flavor },
            "image": { "id": self.image },
            "metadata": envelope.wrap_metadata(&self.metadata),
            "attachments": {
                "floating_ips": self.floating_ips,
                "firewall": self.firewall,
            },
            "created": self.created.to_rfc3339(),
            "updated": self.updated.to_rfc3339(),
        })
    }

    pub fn touch(&mut self) {
        self.updated = Utc::now();
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Flavor {
    pub id: u64,
    pub name: String,
    pub vcpus: u32,
    pub ram: u32,
    pub disk: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Image {
    pub id: u64,
    pub name: String,
    pub status: String,
    pub size: u64,
    pub os: String,
}

impl Image {
    pub fn to_json(&self, envelope: EnvelopeStyle) -> Value {
        let metadata = BTreeMap::from([("os".to_string(), self.os.clone())]);
        json!({
            "id": self.id,
            "name": self.name,
            "status": self.status,
            "size": self.size,
            "metadata": envelope.wrap_metadata(&metadata),
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub name: String,
    pub status: String,
    pub cidr: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub status: String,
    pub size: u64,
    pub server_id: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Keypair {
    pub name: String,
    pub public_key: String,
    pub fingerprint: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuotaLimit {
    pub resource: String,
    pub limit: u64,
}

pub struct AppStateInner {
    pub servers: BTreeMap<u64, Server>,
    pub flavors: BTreeMap<u64, Flavor>,
    pub images: BTreeMap<u64, Image>,
    pub networks: BTreeMap<String, Network>,
    pub volumes: BTreeMap<String, Volume>,
    pub keypairs: BTreeMap<String, Keypair>,
    pub pools: Vec<String>,
    pub limits: Vec<QuotaLimit>,
    /// Status code returned by the next action on a server.
    pub failures: HashMap<u64, u16>,
    /// Users known to the admin endpoint.
    pub users: BTreeMap<String, bool>,
    pub next_id: u64,
}

impl AppStateInner {
    pub fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Servers that still exist.
    pub fn live_servers(&self) -> impl Iterator<Item = &Server> {
        self.servers.values().filter(|s| s.status != "DELETED")
    }

    /// `{resource, limit, usage}` records, usage computed from live servers.
    pub fn quotas(&self) -> Vec<Value> {
        let mut usage: HashMap<&str, u64> = HashMap::new();
        for server in self.live_servers() {
            *usage.entry("vm").or_default() += 1;
            if let Some(flavor) = self.flavors.get(&server.flavor) {
                *usage.entry("cpu").or_default() += flavor.vcpus as u64;
                *usage.entry("ram").or_default() += flavor.ram as u64;
                *usage.entry("disk").or_default() += flavor.disk as u64;
            }
        }
        self.limits
            .iter()
            .map(|q| {
                json!({
                    "resource": q.resource,
                    "limit": q.limit,
                    "usage": usage.get(q.resource.as_str()).copied().unwrap_or(0),
                })
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub inner: Arc<RwLock<AppStateInner>>,
    pub options: Arc<MockOptions>,
}

impl AppState {
    pub fn new(options: MockOptions) -> Self {
        let mut state = AppStateInner {
            servers: BTreeMap::new(),
            flavors: BTreeMap::new(),
            images: BTreeMap::new(),
            networks: BTreeMap::new(),
            volumes: BTreeMap::new(),
            keypairs: BTreeMap::new(),
            pools: Vec::new(),
            limits: Vec::new(),
            failures: HashMap::new(),
            users: BTreeMap::new(),
            next_id: 1,
        };

        if options.seed {
            Self::init_mock_data(&mut state);
        }

        AppState {
            inner: Arc::new(RwLock::new(state)),
            options: Arc::new(options),
        }
    }

    pub fn envelope(&self) -> EnvelopeStyle {
        self.options.envelope
    }

    /// Make the next action on `server_id` fail with `status`.
    pub async fn fail_next_action(&self, server_id: u64, status: u16) {
        self.inner.write().await.failures.insert(server_id, status);
    }

    /// Set the status of a server as if the backend had changed it.
    pub async fn set_status(&self, server_id: u64, status: &str) -> bool {
        let mut inner = self.inner.write().await;
        match inner.servers.get_mut(&server_id) {
            Some(server) => {
                server.status = status.to_string();
                server.touch();
                true
            }
            None => false,
        }
    }

    /// Move a server to `status` after the transition delay.
    pub fn settle(&self, server_id: u64, status: &'static str) {
        let state = self.clone();
        let delay = self.options.transition_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut inner = state.inner.write().await;
            if let Some(server) = inner.servers.get_mut(&server_id)
                && server.status != "DELETED"
            {
                server.status = status.to_string();
                server.touch();
                tracing::debug!("server {} settled in {}", server_id, status);
            }
        });
    }

    fn init_mock_data(state: &mut AppStateInner) {
        let now = Utc::now();

        for (id, name, vcpus, ram, disk) in [
            (1, "C1R1024D20", 1, 1024, 20),
            (2, "C2R2048D40", 2, 2048, 40),
            (3, "C4R4096D80", 4, 4096, 80),
            (4, "C8R8192D160", 8, 8192, 160),
        ] {
            state.flavors.insert(
                id,
                Flavor {
                    id,
                    name: name.to_string(),
                    vcpus,
                    ram,
                    disk,
                },
            );
        }

        for (id, name, os) in [
            (101, "Debian Bookworm", "debian"),
            (102, "Ubuntu Noble", "ubuntu"),
            (103, "Fedora 40", "fedora"),
        ] {
            state.images.insert(
                id,
                Image {
                    id,
                    name: name.to_string(),
                    status: "ACTIVE".to_string(),
                    size: 2 * 1024 * 1024 * 1024,
                    os: os.to_string(),
                },
            );
        }

        for (name, cidr) in [("public", "192.0.2.0/24"), ("private", "10.0.0.0/24")] {
            let id = Uuid::new_v4().to_string();
            state.networks.insert(
                id.clone(),
                Network {
                    id,
                    name: name.to_string(),
                    status: "ACTIVE".to_string(),
                    cidr: cidr.to_string(),
                },
            );
        }

        for (name, status, flavor, image) in [
            ("web-server-01", "ACTIVE", 2, 101),
            ("database", "ACTIVE", 3, 102),
            ("dev-env", "STOPPED", 1, 103),
        ] {
            let id = state.allocate_id();
            state.servers.insert(
                id,
                Server {
                    id,
                    name: name.to_string(),
                    status: status.to_string(),
                    flavor,
                    image,
                    metadata: BTreeMap::from([("role".to_string(), name.to_string())]),
                    floating_ips: Vec::new(),
                    firewall: BTreeMap::new(),
                    created: now,
                    updated: now,
                },
            );
        }

        let volume_id = Uuid::new_v4().to_string();
        state.volumes.insert(
            volume_id.clone(),
            Volume {
                id: volume_id,
                name: "database-data".to_string(),
                status: "IN-USE".to_string(),
                size: 100,
                server_id: Some(2),
            },
        );

        state.keypairs.insert(
            "laptop".to_string(),
            Keypair {
                name: "laptop".to_string(),
                public_key: "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIMockKey laptop".to_string(),
                fingerprint: "SHA256:mock".to_string(),
            },
        );

        state.pools = vec!["public".to_string()];

        for (resource, limit) in [("vm", 10), ("cpu", 32), ("ram", 65536), ("disk", 1000)] {
            state.limits.push(QuotaLimit {
                resource: resource.to_string(),
                limit,
            });
        }

        state.users.insert("alice".to_string(), true);
        state.users.insert("bob".to_string(), true);
    }
}
