use std::sync::Arc;

use glam::Vec3;

use tessera::net::UpdateFragment;
use tessera::prediction::PredictionContext;
use tessera::{
    AlwaysRelevant, ClientConfig, ClientEvent, ClientId, ClientReplicator, ComponentKind,
    ComponentRegistry, ComponentValue, DeliveryOutcome, FieldKind, IdAllocator, NetworkId,
    OwnerTag, PredictionTag, ReplicatedWorld, ServerConfig, ServerReplicator, Simulation,
    StoreConfig, Tick, UpdateKind,
};

const DT: f32 = 1.0 / 60.0;

/// Spawns a projectile on the ticks it fires.
struct Shooter {
    position: ComponentKind,
    spawned: Vec<NetworkId>,
}

impl Simulation for Shooter {
    type Input = bool;

    fn step(&mut self, ctx: &mut PredictionContext<'_>, _tick: Tick, fire: &bool) {
        if *fire && let Some(id) = ctx.spawn() {
            ctx.write(id, self.position, ComponentValue::from_vec3(Vec3::ZERO));
            if !self.spawned.contains(&id) {
                self.spawned.push(id);
            }
        }
    }

    fn encode_input(&self, fire: &bool) -> Vec<u8> {
        vec![*fire as u8]
    }
}

/// One server and one client wired back to back, with a switch to drop
/// whole updates on the way.
struct Session {
    server: ServerReplicator,
    world: ReplicatedWorld,
    alloc: IdAllocator,
    client: ClientReplicator<Shooter>,
    sim: Shooter,
    position: ComponentKind,
    client_id: ClientId,
    tick: Tick,
    next_packet: u32,
    time: f64,
    allow_spawns: bool,
    fire_next: bool,
    events: Vec<ClientEvent>,
    sent_kinds: Vec<UpdateKind>,
    held: Vec<(ClientId, u32, UpdateFragment)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Deliver,
    Drop,
    /// Sent but delayed until [`Session::release_held`].
    Hold,
}

impl Session {
    fn new(config: ServerConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut registry = ComponentRegistry::new();
        let q = FieldKind::quantized(-512.0, 512.0, 0.01).unwrap();
        let position = registry.register("position", &[q, q, q], true).unwrap();
        let registry = Arc::new(registry);

        let client_id = ClientId(1);
        let mut server = ServerReplicator::new(Arc::clone(&registry), config);
        server.add_client(client_id, 1, None).unwrap();
        let client = ClientReplicator::new(registry, 1, ClientConfig::default()).unwrap();

        Self {
            server,
            world: ReplicatedWorld::new(),
            alloc: IdAllocator::new(OwnerTag::SERVER),
            client,
            sim: Shooter {
                position,
                spawned: Vec::new(),
            },
            position,
            client_id,
            tick: 0,
            next_packet: 1,
            time: 0.0,
            allow_spawns: true,
            fire_next: false,
            events: Vec::new(),
            sent_kinds: Vec::new(),
            held: Vec::new(),
        }
    }

    fn spawn_at(&mut self, at: Vec3) -> NetworkId {
        let id = self.alloc.allocate().unwrap();
        self.world.insert(id, self.position, ComponentValue::from_vec3(at));
        id
    }

    fn move_to(&mut self, id: NetworkId, at: Vec3) {
        self.world.insert(id, self.position, ComponentValue::from_vec3(at));
    }

    /// Runs one server tick, then one frame of the client.
    fn step(&mut self, deliver: bool) {
        self.step_over(if deliver { Link::Deliver } else { Link::Drop });
    }

    fn step_over(&mut self, link: Link) {
        self.tick += 1;
        let tick = self.tick;

        for (client, input) in self.server.take_inputs(tick) {
            if input.payload.first() == Some(&1)
                && let Some(id) = self.server.assign_spawn(client, self.allow_spawns)
            {
                self.world.insert(id, self.position, ComponentValue::from_vec3(Vec3::ZERO));
            }
        }

        self.server.stage_world(&self.world).unwrap();
        self.server.commit(tick).unwrap();
        self.world.advance_tick();
        let updates = self.server.build_updates(&self.world, &AlwaysRelevant);

        for update in updates {
            self.sent_kinds.push(update.kind);
            for fragment in update.fragments {
                let seq = self.next_packet;
                self.next_packet += 1;
                self.server.register_sent(update.client, update.update_seq, seq);
                match link {
                    Link::Deliver => self.deliver(update.client, seq, fragment),
                    Link::Drop => {
                        self.server.handle_delivery(update.client, seq, DeliveryOutcome::Lost)
                    }
                    Link::Hold => self.held.push((update.client, seq, fragment)),
                }
            }
        }

        self.time += DT as f64;
        let fire = &mut self.fire_next;
        let frame = self.client.advance(&mut self.sim, DT, |_| std::mem::take(fire));
        for input in frame.inputs {
            self.server.queue_input(self.client_id, input);
        }
    }

    fn deliver(&mut self, client: ClientId, seq: u32, fragment: UpdateFragment) {
        if let Some(event) = self.client.receive_fragment(fragment, self.time) {
            if event.response().is_some() {
                self.server
                    .request_resync(self.client_id, self.client.last_good_tick());
            }
            self.events.push(event);
        }
        self.server.handle_delivery(client, seq, DeliveryOutcome::Acked);
    }

    fn release_held(&mut self) {
        for (client, seq, fragment) in std::mem::take(&mut self.held) {
            self.deliver(client, seq, fragment);
        }
    }

    fn client_position(&self, id: NetworkId) -> Option<Vec3> {
        self.client
            .prediction()
            .confirmed()
            .get(id, self.position)
            .and_then(ComponentValue::as_vec3)
    }

    fn server_position(&self, id: NetworkId) -> Option<Vec3> {
        self.server
            .store()
            .read_component(id, self.position)
            .and_then(|v| v.as_vec3())
    }

    fn assert_client_near(&self, id: NetworkId, expected: Vec3) {
        let actual = self.client_position(id).unwrap();
        assert!(actual.abs_diff_eq(expected, 0.01), "{id}: {actual} != {expected}");
    }

    fn assert_converged(&self) {
        let mut server_ids = self.server.store().entities();
        server_ids.sort();
        let mut client_ids: Vec<NetworkId> = self.client.prediction().confirmed().ids().collect();
        client_ids.sort();
        assert_eq!(server_ids, client_ids);
        for id in server_ids {
            assert_eq!(self.client_position(id), self.server_position(id), "{id} diverged");
        }
    }
}

#[test]
fn test_snapshot_then_deltas() {
    let mut s = Session::new(ServerConfig::default());
    let ids: Vec<NetworkId> = (0..5)
        .map(|i| s.spawn_at(Vec3::new(i as f32, 0.0, 0.0)))
        .collect();

    s.step(true);
    assert_eq!(
        s.events[0],
        ClientEvent::Applied {
            tick: 1,
            kind: UpdateKind::Snapshot,
            entities: 5
        }
    );
    s.assert_converged();

    for tick in 2..=20 {
        for (i, &id) in ids.iter().enumerate() {
            s.move_to(id, Vec3::new(i as f32, tick as f32 * 0.25, 0.0));
        }
        s.step(true);
    }
    assert!(s.sent_kinds[1..].iter().all(|k| *k == UpdateKind::Delta));
    assert_eq!(s.client.last_good_tick(), Some(20));
    s.assert_converged();
}

#[test]
fn test_lost_change_is_resent() {
    let mut s = Session::new(ServerConfig::default());
    let a = s.spawn_at(Vec3::ZERO);
    let b = s.spawn_at(Vec3::X);
    s.step(true);

    s.move_to(a, Vec3::new(3.0, 4.0, 5.0));
    s.step(false);
    s.assert_client_near(a, Vec3::ZERO);

    // nothing changes on the server, yet the lost value goes out again
    s.step(true);
    s.assert_client_near(a, Vec3::new(3.0, 4.0, 5.0));
    s.assert_client_near(b, Vec3::X);
    s.assert_converged();
}

#[test]
fn test_overtaken_update_still_converges() {
    let mut s = Session::new(ServerConfig::default());
    let a = s.spawn_at(Vec3::ZERO);
    let b = s.spawn_at(Vec3::X);
    s.step(true);

    s.move_to(a, Vec3::new(7.0, 0.0, 0.0));
    s.step_over(Link::Hold);
    s.move_to(b, Vec3::new(0.0, 3.0, 0.0));
    s.step(true);
    // the tick 2 update lands after tick 3 and both are acked
    s.release_held();

    assert!(
        s.events
            .iter()
            .any(|e| matches!(e, ClientEvent::Late { tick: 2, .. })),
        "{:?}",
        s.events
    );
    for _ in 0..30 {
        s.step(true);
    }
    s.assert_client_near(a, Vec3::new(7.0, 0.0, 0.0));
    s.assert_client_near(b, Vec3::new(0.0, 3.0, 0.0));
    s.assert_converged();
}

#[test]
fn test_long_outage_recovers_through_resync() {
    let mut s = Session::new(ServerConfig {
        store: StoreConfig { history_ticks: 4 },
        ..Default::default()
    });
    let a = s.spawn_at(Vec3::ZERO);
    let b = s.spawn_at(Vec3::Y);
    s.step(true);

    for tick in 2..=12 {
        s.move_to(a, Vec3::new(tick as f32, 0.0, 0.0));
        if tick == 5 {
            s.world.despawn(b);
        }
        s.step(false);
    }
    assert!(s.sent_kinds.contains(&UpdateKind::Resync));
    assert!(s.client.prediction().confirmed().contains(b));

    for _ in 0..3 {
        s.step(true);
    }
    assert!(!s.client.prediction().confirmed().contains(b));
    s.assert_client_near(a, Vec3::new(12.0, 0.0, 0.0));
    assert!(s.events.iter().all(|e| matches!(e, ClientEvent::Applied { .. })));
    s.assert_converged();
}

#[test]
fn test_predicted_spawn_confirmed() {
    let mut s = Session::new(ServerConfig::default());
    s.spawn_at(Vec3::ZERO);
    s.step(true);
    s.step(true);

    s.fire_next = true;
    for _ in 0..20 {
        s.step(true);
    }

    assert_eq!(s.sim.spawned.len(), 1);
    let id = s.sim.spawned[0];
    assert!(!id.owner().is_server());
    assert!(s.server.store().contains(id));
    assert!(s.client.prediction().confirmed().contains(id));
    assert!(s.client.prediction().predicted().contains(id));
    assert_ne!(s.client.prediction().tag(id), PredictionTag::Cancelled);
    s.assert_converged();
}

#[test]
fn test_refused_spawn_is_cancelled() {
    let mut s = Session::new(ServerConfig::default());
    s.allow_spawns = false;
    s.spawn_at(Vec3::ZERO);
    s.step(true);
    s.step(true);

    s.fire_next = true;
    let mut cancelled = false;
    for _ in 0..20 {
        s.step(true);
        if let Some(&id) = s.sim.spawned.first() {
            cancelled |= s.client.prediction().tag(id) == PredictionTag::Cancelled;
        }
    }

    assert_eq!(s.sim.spawned.len(), 1);
    let id = s.sim.spawned[0];
    assert!(cancelled);
    assert!(!s.server.store().contains(id));
    assert!(!s.client.prediction().confirmed().contains(id));
    assert!(!s.client.prediction().predicted().contains(id));
    s.assert_converged();
}
