//! Reverse proxy routing table (Caddy).
//!
//! Routes are rendered into Caddy's JSON config (host match to a local
//! `reverse_proxy` upstream) and posted whole to the admin `/load` endpoint.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::errors::{PlatformError, ResultExt};
use crate::events::{Event, EventBus, EventType};
use crate::filesys::file::File;
use crate::reconcile::service::ManagedService;
use crate::reconcile::{ReconcileTarget, Reconciler};

/// Proxy options
#[derive(Debug, Clone)]
pub struct Options {
    pub binary: String,

    /// Admin endpoint (host:port)
    pub admin_addr: String,

    pub reload_timeout: Duration,

    /// JSON document the routes are spliced into
    pub template_file: Option<PathBuf>,

    /// Listen addresses of the generated server
    pub listen: Vec<String>,

    /// Spawn caddy ourselves; otherwise an external instance is assumed
    pub manage_process: bool,

    pub config_file: PathBuf,

    /// Output of a managed caddy process
    pub log_file: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            binary: "caddy".to_string(),
            admin_addr: "localhost:2019".to_string(),
            reload_timeout: Duration::from_secs(10),
            template_file: None,
            listen: vec![":80".to_string()],
            manage_process: true,
            config_file: PathBuf::from("caddy.json"),
            log_file: None,
        }
    }
}

/// Desired route of one app
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub domain: String,
    pub port: u16,
}

impl Route {
    /// Upstream dial address
    pub fn upstream(&self) -> String {
        format!("localhost:{}", self.port)
    }
}

/// Caddy reconcile target
pub struct CaddyTarget {
    options: Options,
    config_file: File,
    client: Client,
    service: Option<ManagedService>,
}

impl CaddyTarget {
    fn admin_url(&self, path: &str) -> String {
        format!("http://{}{}", self.options.admin_addr.trim_end_matches('/'), path)
    }

    async fn base_config(&self) -> Result<Value, PlatformError> {
        match &self.options.template_file {
            Some(path) => File::new(path)
                .read_json::<Value>()
                .await
                .with_context(|| format!("failed to read proxy template {}", path.display())),
            None => Ok(json!({
                "admin": { "listen": self.options.admin_addr },
                "apps": { "http": { "servers": { "main": {} } } }
            })),
        }
    }

    /// Whether a reload should be attempted at all
    async fn is_live(&self) -> bool {
        match &self.service {
            Some(service) => service.is_running().await,
            None => true,
        }
    }
}

fn main_server(config: &mut Value) -> Result<&mut Map<String, Value>, PlatformError> {
    let mut current = config;
    for key in ["apps", "http", "servers", "main"] {
        current = current
            .as_object_mut()
            .ok_or_else(|| {
                PlatformError::ConfigError(format!("proxy template: parent of '{key}' is not an object"))
            })?
            .entry(key)
            .or_insert_with(|| Value::Object(Map::new()));
    }
    current
        .as_object_mut()
        .ok_or_else(|| PlatformError::ConfigError("proxy template: 'main' server is not an object".to_string()))
}

fn route_json(route: &Route) -> Value {
    json!({
        "match": [{ "host": [route.domain] }],
        "handle": [{
            "handler": "reverse_proxy",
            "upstreams": [{ "dial": route.upstream() }]
        }]
    })
}

#[async_trait]
impl ReconcileTarget for CaddyTarget {
    type Spec = Route;

    fn name(&self) -> &'static str {
        "caddy"
    }

    fn config_file(&self) -> &File {
        &self.config_file
    }

    async fn render(&self, entries: &BTreeMap<String, Route>) -> Result<Vec<u8>, PlatformError> {
        let mut config = self.base_config().await?;
        let server = main_server(&mut config)?;

        if !server.contains_key("listen") {
            server.insert("listen".to_string(), json!(self.options.listen));
        }
        let routes: Vec<Value> = entries.values().map(route_json).collect();
        server.insert("routes".to_string(), Value::Array(routes));

        Ok(serde_json::to_vec_pretty(&config)?)
    }

    async fn reload(&self, config: &[u8]) -> Result<(), PlatformError> {
        if !self.is_live().await {
            debug!("Caddy not running, config takes effect on next start");
            return Ok(());
        }

        let response = self
            .client
            .post(self.admin_url("/load"))
            .header(header::CONTENT_TYPE, "application/json")
            .timeout(self.options.reload_timeout)
            .body(config.to_vec())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PlatformError::Timeout(format!(
                        "caddy reload exceeded {:?}",
                        self.options.reload_timeout
                    ))
                } else {
                    PlatformError::from(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PlatformError::external(
                "caddy reload",
                format!("status {status}"),
                body,
            ));
        }

        info!("Caddy config reloaded successfully");
        Ok(())
    }
}

/// Reverse proxy manager
pub struct ProxyManager {
    reconciler: Reconciler<CaddyTarget>,
    bus: Arc<EventBus>,
}

impl ProxyManager {
    pub fn new(options: Options, bus: Arc<EventBus>) -> Result<Self, PlatformError> {
        let client = Client::builder().timeout(options.reload_timeout).build()?;

        let service = options.manage_process.then(|| {
            let service = ManagedService::new(
                "caddy",
                options.binary.clone(),
                vec![
                    "run".to_string(),
                    "--config".to_string(),
                    options.config_file.display().to_string(),
                ],
            );
            match &options.log_file {
                Some(path) => service.with_log_file(path.clone()),
                None => service,
            }
        });

        let target = CaddyTarget {
            config_file: File::new(&options.config_file),
            options,
            client,
            service,
        };

        Ok(Self {
            reconciler: Reconciler::new(target),
            bus,
        })
    }

    /// Write the initial config and bring the proxy up (or attach to it)
    pub async fn start(&self) -> Result<(), PlatformError> {
        info!("Starting Caddy...");
        self.reconciler.regenerate().await?;

        match &self.reconciler.target().service {
            Some(service) => {
                service.start().await?;
                if let Err(e) = self.wait_ready(Duration::from_secs(5)).await {
                    warn!("Caddy admin API not reachable: {}", e);
                }
                Ok(())
            }
            None => self.attach().await,
        }
    }

    /// Check that an externally managed proxy answers on its admin endpoint
    pub async fn attach(&self) -> Result<(), PlatformError> {
        let target = self.reconciler.target();
        let response = target
            .client
            .get(target.admin_url("/config/"))
            .send()
            .await
            .context("caddy admin endpoint unreachable")?;

        if !response.status().is_success() {
            return Err(PlatformError::external(
                "caddy",
                format!("admin endpoint returned {}", response.status()),
                "",
            ));
        }
        info!(admin = %target.options.admin_addr, "Attached to running Caddy");
        Ok(())
    }

    async fn wait_ready(&self, limit: Duration) -> Result<(), PlatformError> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            match self.attach().await {
                Ok(()) => return Ok(()),
                Err(e) if tokio::time::Instant::now() >= deadline => return Err(e),
                Err(_) => tokio::time::sleep(Duration::from_millis(200)).await,
            }
        }
    }

    pub async fn stop(&self) -> Result<(), PlatformError> {
        if let Some(service) = &self.reconciler.target().service {
            info!("Stopping Caddy...");
            service.stop().await?;
        }
        Ok(())
    }

    /// Route `domain` to `localhost:<port>` for `app_id`
    pub async fn add_route(&self, app_id: &str, domain: &str, port: u16) -> Result<(), PlatformError> {
        let route = Route {
            domain: domain.to_string(),
            port,
        };
        self.reconciler
            .add(app_id, route)
            .await
            .with_context(|| format!("failed to add route for app {app_id}"))?;

        self.bus.publish(
            Event::new(
                EventType::ProxyConfigured,
                app_id,
                format!("Route {domain} -> localhost:{port} configured"),
            )
            .with_data("domain", domain)
            .with_data("port", port),
        );
        Ok(())
    }

    pub async fn remove_route(&self, app_id: &str) -> Result<(), PlatformError> {
        self.reconciler
            .remove(app_id)
            .await
            .with_context(|| format!("failed to remove route for app {app_id}"))
    }

    pub async fn routes(&self) -> BTreeMap<String, Route> {
        self.reconciler.entries().await
    }

    pub fn config_file(&self) -> &File {
        self.reconciler.target().config_file()
    }
}
