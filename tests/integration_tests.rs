//! End-to-end scenarios spanning the bus, registry, and CNP manager
//! together, mirroring how an external agent framework actually drives
//! this crate: register a capability, register a bus handler, announce
//! a task, bid, and let the winner get awarded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use swarm_coordination::{
    AgentId, Capability, CapabilityRegistry, ContractNetManager, Message, MessageBuilder, MessageBus,
    MessageHandler, MessageType, Vec3i,
};

struct Capture(Mutex<Vec<Message>>);
impl Capture {
    fn new() -> Self {
        Self(Mutex::new(Vec::new()))
    }
    fn take(&self) -> Vec<Message> {
        self.0.lock().unwrap().clone()
    }
}
impl MessageHandler for Capture {
    fn handle(&self, message: &Message) {
        self.0.lock().unwrap().push(message.clone());
    }
}

#[test]
fn direct_delivery_end_to_end() {
    let bus = MessageBus::new();
    let a = AgentId::new(1);
    let b = AgentId::new(2);
    let capture = Arc::new(Capture::new());
    bus.register(a, Arc::new(|_: &Message| {}));
    bus.register(b, capture.clone());

    let m = MessageBuilder::new(a, MessageType::StatusUpdate, "hi")
        .to(b)
        .build(bus.fresh_message_id());
    bus.send(m);
    bus.tick();

    let received = capture.take();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].sender_id, a);
    assert_eq!(received[0].content, "hi");
    assert_eq!(received[0].recipient_id, Some(b));
    assert!(!received[0].is_broadcast());
}

#[test]
fn broadcast_exclusion_end_to_end() {
    let bus = MessageBus::new();
    let a = AgentId::new(1);
    let b = AgentId::new(2);
    let c = AgentId::new(3);
    let cap_a = Arc::new(Capture::new());
    let cap_b = Arc::new(Capture::new());
    let cap_c = Arc::new(Capture::new());
    bus.register(a, cap_a.clone());
    bus.register(b, cap_b.clone());
    bus.register(c, cap_c.clone());

    bus.broadcast(a, MessageType::Alert, "danger", HashMap::new());
    bus.tick();

    assert!(cap_a.take().is_empty());
    let from_b = cap_b.take();
    let from_c = cap_c.take();
    assert_eq!(from_b.len(), 1);
    assert_eq!(from_c.len(), 1);
    assert!(from_b[0].is_broadcast());
    assert_eq!(from_b[0].recipient_id, None);
}

#[tokio::test]
async fn request_response_end_to_end() {
    let bus = Arc::new(MessageBus::new());
    let a = AgentId::new(1);
    let b = AgentId::new(2);

    let bus_for_b = bus.clone();
    bus.register(
        b,
        Arc::new(move |incoming: &Message| {
            if incoming.content == "REQUEST" {
                let correlation = incoming.correlation_id.unwrap();
                let response = MessageBuilder::new(b, MessageType::Response, "REPLY")
                    .to(incoming.sender_id)
                    .correlated_with(correlation)
                    .build(bus_for_b.fresh_message_id());
                bus_for_b.send_response(response).unwrap();
            }
        }),
    );
    bus.register(a, Arc::new(|_: &Message| {}));

    let bus_clone = bus.clone();
    let task = tokio::spawn(async move {
        bus_clone
            .send_request(
                MessageBuilder::new(a, MessageType::Query, "REQUEST").to(b),
                5_000,
            )
            .await
    });

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    bus.tick();
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    bus.tick();

    let response = task.await.unwrap().expect("a response");
    assert_eq!(response.content, "REPLY");

    // No lingering "REQUEST" message sits in b's queue.
    bus.tick();
}

#[test]
fn cnp_happy_path_end_to_end() {
    let manager = ContractNetManager::new();
    let requester = AgentId::new(0);
    let id = manager.announce_task(serde_json::json!({"kind": "mine"}), requester, None);

    let bidders = [
        (AgentId::new(1), 0.7f32, 40_000u64, 0.8f32),
        (AgentId::new(2), 0.9, 25_000, 0.95),
        (AgentId::new(3), 0.6, 50_000, 0.7),
    ];
    for (bidder, score, time_ms, confidence) in bidders {
        assert!(manager.submit_bid(swarm_coordination::TaskBid {
            announcement_id: id.clone(),
            bidder_id: bidder,
            score,
            estimated_time_ms: time_ms,
            confidence,
            capabilities: HashMap::new(),
        }));
    }

    let winning = manager.award_to_best_bidder(&id).expect("a winner");
    assert_eq!(winning.bidder_id, AgentId::new(2));
    assert_eq!(
        manager.state_of(&id),
        Some(swarm_coordination::NegotiationState::Awarded)
    );
}

#[test]
fn deadline_expiration_end_to_end() {
    let manager = ContractNetManager::new();
    let id = manager.announce_task(serde_json::json!({}), AgentId::new(0), Some(10));
    std::thread::sleep(std::time::Duration::from_millis(20));

    let rejected = manager.submit_bid(swarm_coordination::TaskBid {
        announcement_id: id.clone(),
        bidder_id: AgentId::new(1),
        score: 0.5,
        estimated_time_ms: 1000,
        confidence: 0.5,
        capabilities: HashMap::new(),
    });
    assert!(!rejected);
    assert_eq!(
        manager.state_of(&id),
        Some(swarm_coordination::NegotiationState::Expired)
    );
}

#[test]
fn best_agent_selection_end_to_end() {
    let registry = CapabilityRegistry::new();

    let specialist_id = AgentId::new(1);
    let specialist = Arc::new(Capability::new(specialist_id, "Specialist"));
    specialist.set_proficiency("mining", 0.9).unwrap();
    specialist.update_load(0.2);
    specialist.update_position(Vec3i::new(100, 64, 100));
    registry.register(specialist_id, specialist).unwrap();

    let generalist_id = AgentId::new(2);
    let generalist = Arc::new(Capability::new(generalist_id, "Generalist"));
    generalist.set_proficiency("mining", 0.7).unwrap();
    generalist.update_load(0.5);
    generalist.update_position(Vec3i::new(10, 64, 10));
    registry.register(generalist_id, generalist).unwrap();

    let novice_id = AgentId::new(3);
    let novice = Arc::new(Capability::new(novice_id, "Novice"));
    novice.set_proficiency("mining", 0.6).unwrap();
    novice.update_load(0.1);
    novice.update_position(Vec3i::new(5, 64, 5));
    registry.register(novice_id, novice).unwrap();

    let mut required = HashMap::new();
    required.insert("mining".to_string(), 0.5);

    let best = registry
        .find_best_agent(&required, Some(Vec3i::new(0, 64, 0)))
        .expect("a best agent");

    assert_ne!(best.agent_id, specialist_id);
    assert!(best.agent_id == generalist_id || best.agent_id == novice_id);
}
