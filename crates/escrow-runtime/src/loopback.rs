//! In-process transport
//!
//! Routes the mailbox effects of several engines to each other. Envelopes go
//! through the wire codec on the way, so a node sees exactly what a real
//! transport would hand it. Nodes can be taken offline: messages for them
//! are parked in a mailbox and the sender is told `StoredInMailbox`; the
//! mailbox is flushed when the node comes back.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use escrow_core::channel::{Effect, EffectReceiver, Event, EventSender};
use escrow_core::delivery::DeliveryOutcome;
use escrow_core::message::NetworkEnvelope;
use escrow_core::types::{NodeAddress, Uid};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Counters of the loopback network
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoopbackStatistics {
    pub delivered: u64,
    pub stored_in_mailbox: u64,
    pub faults: u64,
    pub statistics_published: u64,
}

struct Node {
    events: EventSender,
    online: bool,
    mailbox: VecDeque<Vec<u8>>,
}

#[derive(Default)]
struct Router {
    nodes: HashMap<NodeAddress, Node>,
    stats: LoopbackStatistics,
}

/// Shared in-process network; clones route through the same nodes
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    router: Arc<Mutex<Router>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn router(&self) -> MutexGuard<'_, Router> {
        self.router.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Connect an engine: its effects are routed, inbound traffic goes to `events`
    pub fn attach(
        &self,
        address: NodeAddress,
        events: EventSender,
        mut effects: EffectReceiver,
    ) -> JoinHandle<()> {
        self.router().nodes.insert(
            address.clone(),
            Node {
                events,
                online: true,
                mailbox: VecDeque::new(),
            },
        );
        info!(address = %address, "Node attached to loopback network");

        let network = self.clone();
        tokio::spawn(async move {
            loop {
                match effects.recv().await {
                    Ok(Effect::SendMailbox {
                        recipient, envelope, ..
                    }) => network.route(&address, recipient, *envelope).await,
                    Ok(Effect::PublishTradeStatistics(statistics)) => {
                        debug!(currency = %statistics.currency, amount = %statistics.amount, "Trade statistics published");
                        network.router().stats.statistics_published += 1;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(address = %address, skipped, "Loopback lagged behind effects");
                    }
                    Err(RecvError::Closed) => {
                        debug!(address = %address, "Effect channel closed, detaching");
                        break;
                    }
                }
            }
        })
    }

    /// Take a node on or offline; coming online flushes its mailbox in order
    pub async fn set_online(&self, address: &NodeAddress, online: bool) {
        let flushed = {
            let mut router = self.router();
            let Some(node) = router.nodes.get_mut(address) else {
                warn!(address = %address, "Unknown loopback node");
                return;
            };
            node.online = online;
            if !online {
                info!(address = %address, "Node offline");
                return;
            }
            let parked: Vec<_> = node.mailbox.drain(..).collect();
            info!(address = %address, parked = parked.len(), "Node online");
            (node.events.clone(), parked)
        };
        let (events, parked) = flushed;
        for bytes in parked {
            deliver(&events, &bytes).await;
        }
    }

    pub fn is_online(&self, address: &NodeAddress) -> bool {
        self.router()
            .nodes
            .get(address)
            .is_some_and(|node| node.online)
    }

    pub fn mailbox_len(&self, address: &NodeAddress) -> usize {
        self.router()
            .nodes
            .get(address)
            .map_or(0, |node| node.mailbox.len())
    }

    pub fn statistics(&self) -> LoopbackStatistics {
        self.router().stats.clone()
    }

    async fn route(&self, from: &NodeAddress, to: NodeAddress, envelope: NetworkEnvelope) {
        let uid = envelope.uid;
        let kind = envelope.kind();
        let encoded = envelope.to_bytes();
        let (outcome, recipient, sender, bytes) = {
            let mut guard = self.router();
            let router = &mut *guard;
            let sender = router.nodes.get(from).map(|node| node.events.clone());
            match (encoded, router.nodes.get_mut(&to)) {
                (Err(e), _) => {
                    router.stats.faults += 1;
                    let outcome = DeliveryOutcome::Fault {
                        reason: format!("encoding failed: {}", e),
                    };
                    (outcome, None, sender, Vec::new())
                }
                (Ok(bytes), Some(node)) if node.online => {
                    router.stats.delivered += 1;
                    (DeliveryOutcome::Arrived, Some(node.events.clone()), sender, bytes)
                }
                (Ok(bytes), Some(node)) => {
                    node.mailbox.push_back(bytes);
                    router.stats.stored_in_mailbox += 1;
                    (DeliveryOutcome::StoredInMailbox, None, sender, Vec::new())
                }
                (Ok(_), None) => {
                    router.stats.faults += 1;
                    let outcome = DeliveryOutcome::Fault {
                        reason: format!("no route to {}", to),
                    };
                    (outcome, None, sender, Vec::new())
                }
            }
        };

        debug!(from = %from, to = %to, kind, uid = %uid, outcome = ?outcome, "Routed envelope");
        if let Some(events) = recipient {
            deliver(&events, &bytes).await;
        }
        report(sender, uid, outcome).await;
    }
}

async fn deliver(events: &EventSender, bytes: &[u8]) {
    match NetworkEnvelope::from_bytes(bytes) {
        Ok(envelope) => {
            if events
                .send(Event::MessageReceived(Box::new(envelope)))
                .await
                .is_err()
            {
                debug!("Recipient engine stopped, envelope dropped");
            }
        }
        Err(e) => warn!(error = %e, "Undecodable envelope dropped"),
    }
}

async fn report(sender: Option<EventSender>, uid: Uid, outcome: DeliveryOutcome) {
    if let Some(events) = sender {
        if events
            .send(Event::DeliveryReport { uid, outcome })
            .await
            .is_err()
        {
            debug!(uid = %uid, "Sender engine stopped, delivery report dropped");
        }
    }
}
