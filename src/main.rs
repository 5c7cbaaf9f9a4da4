//! peerlink-node: run several link managers on an in-process discovery medium
//!
//! Every node discovers every other node, negotiates roles, opens a stream
//! and exchanges messages. Status changes and messages are printed as they
//! happen; status and metrics are printed every heartbeat interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use signal_hook::consts::{SIGINT, SIGTERM};

use peerlink::identity::short_id;
use peerlink::{
    ConnectionState, DeviceIdentity, IdentityKeyPair, InboundMessage, LinkConfig, LinkManager,
    LoopbackMedium, MemoryTrustStore, SealedBoxCrypto, TrustStore,
};

/// Default number of in-process nodes
const DEFAULT_NODES: usize = 2;

/// How often the medium replays discovery
const REDISCOVER_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();

    // --nodes <n>        Number of in-process nodes (default 2)
    // --config <path>    JSON LinkConfig
    // --message <text>   Broadcast from the first node once it is connected
    // --plaintext        Skip the key exchange (messages travel unencrypted)

    let nodes: usize = parse_arg(&args, "--nodes")
        .map(|n| n.parse())
        .transpose()
        .map_err(|_| "Invalid --nodes value")?
        .unwrap_or(DEFAULT_NODES);
    if nodes < 2 {
        return Err("--nodes must be at least 2".into());
    }
    let config = match parse_arg(&args, "--config") {
        Some(path) => LinkConfig::from_file(path)?,
        None => LinkConfig::default(),
    };
    let message = parse_arg(&args, "--message");
    let plaintext = args.iter().any(|a| a == "--plaintext");

    log::info!("peerlink-node starting...");
    log::info!("  Nodes:     {}", nodes);
    log::info!("  Service:   {}", config.service_name);
    log::info!("  Heartbeat: {:?}", config.heartbeat_interval());
    log::info!("  Crypto:    {}", if plaintext { "disabled" } else { "enabled" });

    // Shutdown flag flipped by SIGINT/SIGTERM
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))?;

    let medium = LoopbackMedium::new();
    let managers = build_nodes(&medium, &config, nodes, plaintext)?;

    for manager in &managers {
        let me = short_id(manager.device_id()).to_string();
        let me_status = me.clone();
        manager.start_discovery(
            move |msg: InboundMessage, _from| print_message(&me, &msg),
            move |peer: &str, state: ConnectionState| {
                println!("[{}] {} -> {}", me_status, short_id(peer), state);
            },
        )?;
    }

    run(&medium, &managers, &config, message.as_deref(), &shutdown);

    log::info!("Shutting down...");
    for manager in &managers {
        manager.stop_discovery();
    }
    Ok(())
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

// ============================================================================
// Nodes
// ============================================================================

fn build_nodes(
    medium: &Arc<LoopbackMedium>,
    config: &LinkConfig,
    count: usize,
    plaintext: bool,
) -> Result<Vec<LinkManager>, Box<dyn std::error::Error>> {
    let mut nodes = Vec::with_capacity(count);
    for i in 0..count {
        let name = format!("node-{}", i);
        let device_id = DeviceIdentity::derive(&["peerlink-node", &name]);
        let keys = IdentityKeyPair::generate()?;
        nodes.push((name, device_id, keys, Arc::new(MemoryTrustStore::new())));
    }

    // Out-of-band key exchange: every node trusts every other node
    if !plaintext {
        for (_, id, keys, _) in &nodes {
            for (_, other_id, _, trust) in &nodes {
                if other_id != id {
                    trust.store_peer_public_key(id, keys.public.clone())?;
                }
            }
        }
    }

    let mut managers = Vec::with_capacity(count);
    for (name, device_id, keys, trust) in nodes {
        managers.push(LinkManager::new(
            config.clone(),
            device_id,
            Arc::new(medium.endpoint(name)),
            Arc::new(SealedBoxCrypto::new(keys)),
            trust,
        )?);
    }
    Ok(managers)
}

// ============================================================================
// Run Loop
// ============================================================================

fn run(
    medium: &Arc<LoopbackMedium>,
    managers: &[LinkManager],
    config: &LinkConfig,
    message: Option<&str>,
    shutdown: &AtomicBool,
) {
    let mut pending_message = message;
    let mut last_report = Instant::now();

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(REDISCOVER_INTERVAL);
        medium.rediscover();

        if let Some(text) = pending_message {
            let first = &managers[0];
            if first.connected_peers().len() == managers.len() - 1 {
                match first.send_message(text, None) {
                    Ok(n) => log::info!("Broadcast delivered to {} peers", n),
                    Err(e) => log::warn!("Broadcast failed: {}", e),
                }
                pending_message = None;
            }
        }

        if last_report.elapsed() >= config.heartbeat_interval() {
            last_report = Instant::now();
            for manager in managers {
                println!("[{}] {}", short_id(manager.device_id()), manager.connection_status());
            }
            print!("{}", managers[0].render_metrics());
        }
    }
}

fn print_message(me: &str, msg: &InboundMessage) {
    let marker = if msg.was_unencrypted() { " (unencrypted)" } else { "" };
    println!(
        "[{}] <{}>{} {}",
        me,
        short_id(&msg.sender_id),
        marker,
        msg.content.preview()
    );
}
