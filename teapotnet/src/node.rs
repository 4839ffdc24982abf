//! Node assembly
//!
//! Builds the stack bottom-up: block store, overlay, contact plane.
//! Contacts from the configuration get listeners that admit their
//! links and a periodic reconnect pass keeps links alive.

use crate::config::Config;
use crate::identity::{self, LocalIdentity};
use anyhow::{Context, Result};
use lib_crypto::{Digest, PublicIdentity};
use lib_network::{Link, Listener, Network, NetworkConfig};
use lib_overlay::{Overlay, OverlayConfig};
use lib_runtime::{Scheduler, TaskPool};
use lib_storage::{BlockStore, StoreConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Period of the contact reconnect pass
const RECONNECT_PERIOD: Duration = Duration::from_secs(30);

struct ContactListener {
    uname: String,
}

impl Listener for ContactListener {
    fn connected(&self, link: &Link, status: bool) {
        if status {
            info!(contact = %self.uname, link = ?link, "contact connected");
        } else {
            info!(contact = %self.uname, link = ?link, "contact disconnected");
        }
    }

    fn recv(&self, _link: &Link, record_type: &str, _payload: &[u8]) -> bool {
        debug!(contact = %self.uname, record_type, "record from contact");
        false
    }

    fn auth(&self, _link: &Link, _key: &PublicIdentity) -> bool {
        // The listener is registered under this contact's identifier;
        // the transport already proved the key matches it
        true
    }
}

pub struct Node {
    pub identity: LocalIdentity,
    pub store: BlockStore,
    pub overlay: Arc<Overlay>,
    pub network: Arc<Network>,
    pub scheduler: Scheduler,
}

impl Node {
    pub async fn start(config: &Config, no_bootstrap: bool) -> Result<Node> {
        Self::start_with_bits(config, no_bootstrap, 2048).await
    }

    /// Key size override for tests
    pub async fn start_with_bits(
        config: &Config,
        no_bootstrap: bool,
        bits: usize,
    ) -> Result<Node> {
        let identity = identity::load_or_create_with_bits(
            &config.data_dir.join("identity.json"),
            &config.user_name,
            bits,
        )?;

        let pool = TaskPool::new(8);
        let scheduler = Scheduler::new(pool);

        let store = BlockStore::open(StoreConfig {
            root: config.data_dir.clone(),
            quota: config.store_quota,
        })
        .context("cannot open block store")?;

        let overlay = Overlay::start(
            identity.node.clone(),
            OverlayConfig {
                bind: format!("0.0.0.0:{}", config.port)
                    .parse()
                    .expect("static address format"),
                advertise: Vec::new(),
                ping_interval: Duration::from_secs(10),
            },
            scheduler.clone(),
        )
        .await
        .context("cannot start overlay (is the port in use?)")?;

        let network = Network::start(
            overlay.clone(),
            store.clone(),
            identity.user.clone(),
            NetworkConfig {
                accept_any_contact: config.accept_unknown_contacts,
                ..NetworkConfig::default()
            },
            scheduler.clone(),
        );

        let node = Node { identity, store, overlay, network, scheduler };
        node.register_contacts(config);

        if no_bootstrap {
            info!("bootstrap disabled");
        } else {
            node.bootstrap(config).await;
        }
        node.schedule_reconnect(config);
        Ok(node)
    }

    fn register_contacts(&self, config: &Config) {
        let local = self.network.local_contact();
        for contact in &config.contacts {
            let Some(identifier) = Digest::from_hex(&contact.identifier) else {
                warn!(uname = %contact.uname, "ignoring contact with bad identifier");
                continue;
            };
            let listener = Arc::new(ContactListener { uname: contact.uname.clone() });
            self.network.register_listener(local, identifier, listener);
        }
    }

    async fn bootstrap(&self, config: &Config) {
        for addr in &config.bootstrap {
            match self.overlay.connect(*addr, None).await {
                Ok(node) => info!(%addr, node = ?node, "bootstrap peer connected"),
                Err(e) => warn!(%addr, "bootstrap failed: {e}"),
            }
        }
    }

    /// Periodically try to open links to configured contacts
    fn schedule_reconnect(&self, config: &Config) {
        let identifiers: Vec<Digest> = config
            .contacts
            .iter()
            .filter_map(|c| Digest::from_hex(&c.identifier))
            .collect();
        if identifiers.is_empty() {
            return;
        }
        let network = Arc::downgrade(&self.network);
        self.scheduler.repeat(RECONNECT_PERIOD, move || {
            let Some(network) = network.upgrade() else { return };
            let local = network.local_contact();
            for identifier in identifiers.clone() {
                if network.has_link(&Link::wildcard(local, identifier)) {
                    continue;
                }
                let network = network.clone();
                tokio::spawn(async move {
                    if let Err(e) = network.connect(identifier).await {
                        debug!(contact = ?identifier, "contact unreachable: {e}");
                    }
                });
            }
        });
    }

    /// Run until interrupted
    pub async fn run(&self) -> Result<()> {
        info!(
            node = ?self.overlay.local_node(),
            contact = ?self.network.local_contact(),
            addr = %self.overlay.listen_addr(),
            "node running"
        );
        tokio::signal::ctrl_c().await.context("signal handler failed")?;
        info!("shutting down");
        self.close();
        Ok(())
    }

    pub fn close(&self) {
        self.network.close();
        self.overlay.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContactEntry;

    fn test_config(dir: &std::path::Path, port: u16) -> Config {
        Config {
            port,
            data_dir: dir.to_path_buf(),
            bootstrap: Vec::new(),
            store_quota: 1 << 30,
            contacts: Vec::new(),
            accept_unknown_contacts: true,
            user_name: "tester".to_string(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_node_starts_and_persists_identity() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 0);

        let node = Node::start_with_bits(&config, true, 1024).await.unwrap();
        let contact = node.network.local_contact();
        node.close();
        drop(node);
        // Give the store's background tasks time to release the index
        tokio::time::sleep(Duration::from_millis(500)).await;

        // Same directory, same identity
        let node = Node::start_with_bits(&config, true, 1024).await.unwrap();
        assert_eq!(node.network.local_contact(), contact);
        node.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bad_contact_identifier_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), 0);
        config.contacts.push(ContactEntry {
            uname: "broken".into(),
            name: String::new(),
            identifier: "not hex".into(),
            remote_secret: String::new(),
        });
        // Starting must not fail on a malformed entry
        let node = Node::start_with_bits(&config, true, 1024).await.unwrap();
        node.close();
    }
}
