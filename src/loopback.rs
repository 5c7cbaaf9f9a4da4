//! In-process discovery medium
//!
//! Stands in for the radio layer when every node lives in one process (the
//! demo binary and the integration tests). Nodes attach under a name; each
//! attached node discovers every other node on the same service, control
//! payloads are delivered straight into the addressee's sink, and data
//! streams are ordinary TCP on 127.0.0.1.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::connection::PeerRef;
use crate::error::LinkError;
use crate::transport::{DiscoverySink, DiscoveryTransport};

struct Node {
    service_name: String,
    service_info: Vec<u8>,
    sink: DiscoverySink,
    reachable: bool,
    drop_control: bool,
}

/// Shared medium all loopback endpoints attach to
#[derive(Default)]
pub struct LoopbackMedium {
    nodes: Mutex<HashMap<String, Node>>,
}

impl LoopbackMedium {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Node>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Transport handle for the node called `name`
    pub fn endpoint(self: &Arc<Self>, name: impl Into<String>) -> LoopbackTransport {
        LoopbackTransport {
            medium: self.clone(),
            name: name.into(),
        }
    }

    /// Names of the attached nodes, sorted
    pub fn attached(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Replay discovery for every pair of attached nodes
    pub fn rediscover(&self) {
        let nodes = self.lock();
        let mut deliveries = Vec::new();
        for (to, target) in nodes.iter() {
            for (from, source) in nodes.iter() {
                if from != to && source.service_name == target.service_name {
                    deliveries.push((
                        target.sink.clone(),
                        PeerRef::new(from.clone()),
                        source.service_info.clone(),
                    ));
                }
            }
        }
        drop(nodes);

        for (sink, peer, info) in deliveries {
            sink.peer_discovered(peer, info);
        }
    }

    /// Deliver a single discovery of `from` to `to`
    pub fn announce(&self, from: &str, to: &str) -> bool {
        let nodes = self.lock();
        let (Some(source), Some(target)) = (nodes.get(from), nodes.get(to)) else {
            return false;
        };
        target
            .sink
            .peer_discovered(PeerRef::new(from), source.service_info.clone())
    }

    /// Make `name`'s endpoint unresolvable (or resolvable again)
    pub fn set_reachable(&self, name: &str, reachable: bool) {
        if let Some(node) = self.lock().get_mut(name) {
            node.reachable = reachable;
        }
    }

    /// Silently lose every control payload addressed to `name`
    pub fn set_drop_control(&self, name: &str, drop_control: bool) {
        if let Some(node) = self.lock().get_mut(name) {
            node.drop_control = drop_control;
        }
    }
}

/// One node's view of the [`LoopbackMedium`]
pub struct LoopbackTransport {
    medium: Arc<LoopbackMedium>,
    name: String,
}

impl DiscoveryTransport for LoopbackTransport {
    fn attach(
        &self,
        service_name: &str,
        service_info: &[u8],
        sink: DiscoverySink,
    ) -> Result<(), LinkError> {
        let mut nodes = self.medium.lock();
        if nodes.contains_key(&self.name) {
            return Err(LinkError::Transport(format!(
                "{} is already attached",
                self.name
            )));
        }

        // Mutual discovery: existing nodes see us, we see them
        let mut deliveries = Vec::new();
        for (other_name, other) in nodes.iter() {
            if other.service_name != service_name {
                continue;
            }
            deliveries.push((
                other.sink.clone(),
                PeerRef::new(self.name.clone()),
                service_info.to_vec(),
            ));
            deliveries.push((
                sink.clone(),
                PeerRef::new(other_name.clone()),
                other.service_info.clone(),
            ));
        }

        nodes.insert(
            self.name.clone(),
            Node {
                service_name: service_name.to_string(),
                service_info: service_info.to_vec(),
                sink,
                reachable: true,
                drop_control: false,
            },
        );
        drop(nodes);

        log::debug!("{} attached to loopback medium", self.name);
        for (target, peer, info) in deliveries {
            target.peer_discovered(peer, info);
        }
        Ok(())
    }

    fn detach(&self) {
        if self.medium.lock().remove(&self.name).is_some() {
            log::debug!("{} detached from loopback medium", self.name);
        }
    }

    fn send_control(&self, peer: &PeerRef, payload: &[u8]) -> Result<(), LinkError> {
        let nodes = self.medium.lock();
        let target = nodes
            .get(peer.as_str())
            .ok_or_else(|| LinkError::Transport(format!("{} is not attached", peer)))?;

        if target.drop_control {
            log::debug!("Dropping control message to {}", peer);
            return Ok(());
        }
        if !target
            .sink
            .control_received(PeerRef::new(self.name.clone()), payload.to_vec())
        {
            return Err(LinkError::Transport(format!("{} stopped listening", peer)));
        }
        Ok(())
    }

    fn open_listener(&self, _peer: &PeerRef) -> Result<TcpListener, LinkError> {
        Ok(TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?)
    }

    fn resolve_endpoint(
        &self,
        peer: &PeerRef,
        port: u16,
        _timeout: Duration,
    ) -> Result<SocketAddr, LinkError> {
        match self.medium.lock().get(peer.as_str()) {
            Some(node) if node.reachable => {
                Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
            }
            Some(_) => Err(LinkError::Timeout("endpoint resolution")),
            None => Err(LinkError::Transport(format!("{} is not attached", peer))),
        }
    }
}
