mod server;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};

use chatrelay_api::{AppState, BridgeSettings, ProtocolBridge};
use chatrelay_cluster::{
    Broker, ConnectionRegistry, InMemoryBroker, RedisBroker, RelayBus, RelayBusConfig,
};
use chatrelay_core::{
    bootstrap::load_config,
    config::DirectoryConfig,
    logging,
    service::{AuthVerifier, InMemoryMembership, InMemoryMessageStore, JwtVerifier},
};

use server::{RelayServer, Services};

/// Real-time connection hub with cross-instance relay
#[derive(Debug, Parser)]
#[command(name = "chatrelay", version, about)]
struct Args {
    /// Configuration file (YAML or TOML)
    #[arg(short, long, env = "CHATRELAY_CONFIG_PATH")]
    config: Option<String>,

    /// Identifier of this instance in the relay; generated when omitted
    #[arg(long, env = "CHATRELAY_NODE_ID")]
    node_id: Option<String>,
}

/// Generate a unique node ID for this server instance
fn generate_node_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{hostname}-{}", nanoid::nanoid!(6))
}

fn build_membership(directory: &DirectoryConfig) -> InMemoryMembership {
    let membership = if directory.open {
        InMemoryMembership::open()
    } else {
        InMemoryMembership::new()
    };
    for user in &directory.users {
        membership.add_user(user.as_str());
    }
    for (conversation, members) in &directory.conversations {
        membership.add_conversation(conversation.as_str(), members.iter().map(String::as_str));
    }
    membership
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration
    let config = load_config(args.config.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    let node_id = args.node_id.unwrap_or_else(generate_node_id);
    info!(node_id = %node_id, "chatrelay starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Relay broker
    let broker: Arc<dyn Broker> = if config.is_clustered() {
        let broker = RedisBroker::new(&config.redis.url, config.redis.stream_max_len)
            .context("Failed to create Redis broker")?;
        info!(channel = %config.redis.channel, "Redis relay broker configured");
        Arc::new(broker)
    } else {
        warn!("Redis not configured, running single-node with the in-process broker");
        Arc::new(InMemoryBroker::new())
    };

    // 4. Registry and relay
    let registry = ConnectionRegistry::new();
    let relay = RelayBus::new(
        RelayBusConfig::from_config(&config, node_id),
        broker,
        registry.clone(),
    );
    relay
        .start_subscriber()
        .await
        .context("Failed to subscribe to the relay topic")?;

    // 5. Collaborator services
    let verifier: Arc<dyn AuthVerifier> = Arc::new(
        JwtVerifier::new(config.jwt.secret.as_bytes(), config.jwt.leeway_seconds)
            .context("Failed to create JWT verifier")?,
    );
    let store = Arc::new(InMemoryMessageStore::new());
    let membership = Arc::new(build_membership(&config.directory));
    info!(
        open = config.directory.open,
        conversations = membership.conversation_count(),
        "Membership directory initialized"
    );

    // 6. Protocol bridge and HTTP state
    let bridge = Arc::new(ProtocolBridge::new(
        registry.clone(),
        relay.clone(),
        verifier.clone(),
        store.clone(),
        membership.clone(),
        BridgeSettings::from(&config.connection),
    ));
    let app_state = AppState {
        bridge: bridge.clone(),
        relay: relay.clone(),
        verifier,
        store,
        membership,
        max_message_bytes: config.connection.max_message_bytes,
    };

    let services = Services {
        registry,
        relay,
        bridge,
    };

    RelayServer::new(config, services, app_state).start().await
}
