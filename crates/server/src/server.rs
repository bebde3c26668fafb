use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use anyhow::Result;
use glam::Vec3;
use log::{debug, warn};

use tessera::net::{ConnectionManager, ConnectionState, Packet};
use tessera::{
    Aabb, AlwaysRelevant, ClientId, ColliderFrame, ComponentValue, FrameFlags,
    Hitbox, IdAllocator, NetworkEndpoint, NetworkId, OwnerTag, PacketType, PlayerId,
    ReplicatedWorld, ServerConfig, ServerReplicator, Tick, Transform,
};
use tessera_arena::{ArenaInput, ArenaRules, ArenaSchema, Buttons};

use crate::events::{DisconnectReason, ServerEvent};

const VIEW_HALF_EXTENT: f32 = 60.0;
const MAX_PROJECTILES_PER_PLAYER: usize = 8;
const BOT_ORBIT_RADIUS: f32 = 12.0;
/// Collider centers sit this far above the replicated position.
const BODY_CENTER: Vec3 = Vec3::Y;

/// A packet handed over by the receive task.
#[derive(Debug)]
pub struct Inbound {
    pub packet: Packet,
    pub addr: SocketAddr,
    pub size: usize,
}

pub struct ServerStats {
    pub tick: Tick,
    pub clients: usize,
    pub entities: usize,
    pub packets_lost: u64,
}

/// Authoritative arena: connection handling, gameplay and the replication
/// pipeline, one fixed tick at a time.
pub struct ArenaServer {
    endpoint: NetworkEndpoint,
    connections: ConnectionManager,
    replicator: ServerReplicator,
    schema: ArenaSchema,
    rules: ArenaRules,
    world: ReplicatedWorld,
    ids: IdAllocator,
    avatars: HashMap<ClientId, NetworkId>,
    bots: Vec<NetworkId>,
    pending_events: VecDeque<ServerEvent>,
    tick: Tick,
}

impl ArenaServer {
    pub fn new(endpoint: NetworkEndpoint, config: ServerConfig, bot_count: usize) -> Result<Self> {
        let schema = ArenaSchema::new()?;
        let rules = ArenaRules {
            tick_rate: config.tick_rate,
            ..Default::default()
        };
        let mut server = Self {
            endpoint,
            connections: ConnectionManager::new(config.max_clients),
            replicator: ServerReplicator::new(schema.registry.clone(), config),
            schema,
            rules,
            world: ReplicatedWorld::new(),
            ids: IdAllocator::new(OwnerTag::SERVER),
            avatars: HashMap::new(),
            bots: Vec::new(),
            pending_events: VecDeque::new(),
            tick: 0,
        };
        for _ in 0..bot_count {
            let id = server.ids.allocate()?;
            server.world.insert(id, server.schema.position, ComponentValue::from_vec3(Vec3::ZERO));
            server
                .world
                .insert(id, server.schema.health, ComponentValue::from_u32(server.rules.max_health));
            server.bots.push(id);
        }
        Ok(server)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.pending_events.drain(..)
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            tick: self.tick,
            clients: self.connections.connected_count(),
            entities: self.world.len(),
            packets_lost: self.endpoint.stats().packets_lost,
        }
    }

    pub fn handle(&mut self, inbound: Inbound) {
        let Inbound { packet, addr, size } = inbound;
        let Some(received) = self.endpoint.accept(packet, addr, size) else {
            return;
        };

        if let Some(client) = self.connections.get_by_addr_mut(&addr) {
            client.touch();
            let id = client.client_id;
            for (seq, outcome) in received.outcomes {
                self.replicator.handle_delivery(id, seq, outcome);
            }
        }

        match received.packet.payload {
            PacketType::ConnectionRequest => self.handle_connection_request(addr),
            PacketType::Input(inputs) => {
                let Some(client) = self.connected(addr) else {
                    return;
                };
                for input in inputs {
                    self.replicator.queue_input(client, input);
                }
            }
            PacketType::ResyncRequest { last_good_tick } => {
                if let Some(client) = self.connected(addr) {
                    self.replicator.request_resync(client, last_good_tick);
                }
            }
            PacketType::Ping { timestamp } => self.send(PacketType::Pong { timestamp }, addr),
            PacketType::Disconnect => {
                if let Some(client) = self.connected(addr) {
                    self.drop_client(client, DisconnectReason::Graceful);
                }
            }
            other => debug!("ignoring {other:?} from {addr}"),
        }
    }

    fn connected(&self, addr: SocketAddr) -> Option<ClientId> {
        self.connections
            .get_by_addr(&addr)
            .filter(|c| c.state == ConnectionState::Connected)
            .map(|c| c.client_id)
    }

    fn handle_connection_request(&mut self, addr: SocketAddr) {
        let (client, player, fresh) = match self.connections.get_or_accept(addr) {
            Ok(connection) => {
                let fresh = connection.state != ConnectionState::Connected;
                connection.state = ConnectionState::Connected;
                (connection.client_id, connection.player_id, fresh)
            }
            Err(reason) => {
                self.send(
                    PacketType::ConnectionDenied {
                        reason: reason.to_string(),
                    },
                    addr,
                );
                self.pending_events.push_back(ServerEvent::ConnectionDenied {
                    addr,
                    reason: reason.to_string(),
                });
                return;
            }
        };

        if fresh && let Err(e) = self.admit(client, player, addr) {
            self.pending_events.push_back(ServerEvent::Error {
                message: format!("cannot admit {client}: {e}"),
            });
            self.connections.remove(client);
            return;
        }

        // repeated requests get the same answer; the first one may have been lost
        self.send(
            PacketType::ConnectionAccepted {
                client_id: client.0,
                player_id: player,
                server_tick: self.tick,
                tick_rate: self.rules.tick_rate,
            },
            addr,
        );
    }

    fn admit(&mut self, client: ClientId, player: PlayerId, addr: SocketAddr) -> Result<()> {
        let avatar = self.ids.allocate()?;
        let spawn = self.spawn_point(player);
        self.replicator
            .add_client(client, player, Some(Aabb::from_center(spawn, Vec3::splat(VIEW_HALF_EXTENT))))?;

        let s = &self.schema;
        self.world.insert(avatar, s.position, ComponentValue::from_vec3(spawn));
        self.world.insert(avatar, s.controller, ComponentValue::from_u32(player as u32));
        self.world.insert(avatar, s.health, ComponentValue::from_u32(self.rules.max_health));
        self.avatars.insert(client, avatar);

        self.pending_events.push_back(ServerEvent::ClientConnected {
            client,
            addr,
            player,
            avatar,
        });
        Ok(())
    }

    fn spawn_point(&self, player: PlayerId) -> Vec3 {
        let angle = player as f32 * 2.4;
        Vec3::new(angle.cos(), 0.0, angle.sin()) * 20.0
    }

    fn drop_client(&mut self, client: ClientId, reason: DisconnectReason) {
        self.connections.remove(client);
        self.replicator.remove_client(client);
        if let Some(avatar) = self.avatars.remove(&client) {
            self.world.despawn(avatar);
            self.replicator.forget_collider(avatar);
        }
        self.pending_events
            .push_back(ServerEvent::ClientDisconnected { client, reason });
    }

    pub fn shutdown(&mut self) {
        let clients: Vec<(ClientId, SocketAddr)> =
            self.connections.iter().map(|c| (c.client_id, c.addr)).collect();
        for (client, addr) in clients {
            self.send(PacketType::Disconnect, addr);
            self.drop_client(client, DisconnectReason::Shutdown);
        }
    }

    fn send(&mut self, payload: PacketType, addr: SocketAddr) {
        if let Err(e) = self.endpoint.send_to(payload, addr) {
            self.pending_events.push_back(ServerEvent::Error {
                message: format!("failed to send to {addr}: {e}"),
            });
        }
    }

    /// Runs one fixed tick: gameplay, commit, per-client updates.
    pub fn tick(&mut self) {
        self.tick = self.tick.wrapping_add(1);
        let tick = self.tick;

        self.move_projectiles();
        self.move_bots(tick);
        self.apply_inputs(tick);

        for connection in self.connections.cleanup_timed_out() {
            self.replicator.remove_client(connection.client_id);
            if let Some(avatar) = self.avatars.remove(&connection.client_id) {
                self.world.despawn(avatar);
                self.replicator.forget_collider(avatar);
            }
            self.pending_events.push_back(ServerEvent::ClientDisconnected {
                client: connection.client_id,
                reason: DisconnectReason::Timeout,
            });
        }

        self.record_colliders(tick);

        // the dirty set survives a failed stage so the next tick retries it
        if let Err(e) = self.replicator.stage_world(&self.world) {
            warn!("tick {tick}: staging failed: {e}");
            self.pending_events.push_back(ServerEvent::Error {
                message: format!("tick {tick}: staging failed: {e}"),
            });
            return;
        }
        self.world.advance_tick();
        match self.replicator.commit(tick) {
            Ok(summary) => debug!(
                "tick {tick}: {} changed, {} removed",
                summary.changed.len(),
                summary.removed.len()
            ),
            Err(e) => {
                self.pending_events.push_back(ServerEvent::Error {
                    message: format!("tick {tick}: commit failed: {e}"),
                });
                return;
            }
        }

        self.send_updates();
    }

    fn move_projectiles(&mut self) {
        let s = &self.schema;
        let projectiles: Vec<(NetworkId, Vec3, Vec3)> = self
            .world
            .ids()
            .filter_map(|id| {
                let at = self.world.get(id, s.position)?.as_vec3()?;
                let velocity = self.world.get(id, s.velocity)?.as_vec3()?;
                Some((id, at, velocity))
            })
            .collect();
        for (id, at, velocity) in projectiles {
            match self.rules.move_projectile(at, velocity) {
                Some(next) => self.world.insert(id, s.position, ComponentValue::from_vec3(next)),
                None => {
                    self.world.despawn(id);
                }
            }
        }
    }

    fn move_bots(&mut self, tick: Tick) {
        let count = self.bots.len().max(1) as f32;
        for (i, &bot) in self.bots.iter().enumerate() {
            let phase = i as f32 / count * std::f32::consts::TAU;
            let angle = phase + tick as f32 * self.rules.dt() * 0.5;
            let at = Vec3::new(angle.cos(), 0.0, angle.sin()) * BOT_ORBIT_RADIUS;
            self.world
                .insert(bot, self.schema.position, ComponentValue::from_vec3(at));
        }
    }

    fn apply_inputs(&mut self, tick: Tick) {
        for (client, command) in self.replicator.take_inputs(tick) {
            let Some(input) = ArenaInput::decode(&command.payload) else {
                debug!("{client}: undecodable input for tick {}", command.predicted_tick);
                continue;
            };
            let Some(&avatar) = self.avatars.get(&client) else {
                continue;
            };
            let Some(at) = self.position(avatar) else {
                continue;
            };

            let next = self.rules.move_avatar(at, &input);
            self.world
                .insert(avatar, self.schema.position, ComponentValue::from_vec3(next));
            self.replicator.set_volume(
                client,
                Some(Aabb::from_center(next, Vec3::splat(VIEW_HALF_EXTENT))),
            );

            if input.buttons.contains(Buttons::THROW) {
                self.throw(client, avatar, next, &input);
            }
            if input.buttons.contains(Buttons::FIRE)
                && let Some(hit) = self.replicator.hitscan(
                    avatar,
                    &command,
                    // the shot starts in the shooter's collider space
                    self.rules.muzzle() - BODY_CENTER,
                    input.aim(),
                    self.rules.shot_range,
                )
            {
                self.pending_events.push_back(ServerEvent::Hit {
                    shooter: avatar,
                    target: hit.target,
                    rewound: tick.wrapping_sub(hit.rewind.to),
                    mitigated: hit.mitigated,
                });
                if !hit.mitigated {
                    self.damage(hit.target);
                }
            }
        }
    }

    fn throw(&mut self, client: ClientId, avatar: NetworkId, at: Vec3, input: &ArenaInput) {
        let owner = avatar_owner(self.replicator.player_of(client));
        let live = self
            .world
            .ids()
            .filter(|id| Some(id.owner()) == owner && self.world.get(*id, self.schema.velocity).is_some())
            .count();
        let Some(id) = self
            .replicator
            .assign_spawn(client, live < MAX_PROJECTILES_PER_PLAYER)
        else {
            return;
        };
        let s = &self.schema;
        self.world
            .insert(id, s.position, ComponentValue::from_vec3(at + self.rules.muzzle()));
        self.world
            .insert(id, s.velocity, ComponentValue::from_vec3(self.rules.throw_velocity(input)));
    }

    fn damage(&mut self, target: NetworkId) {
        let s = &self.schema;
        let Some(health) = self.world.get(target, s.health).and_then(ComponentValue::as_u32) else {
            return;
        };
        let left = health.saturating_sub(self.rules.shot_damage);
        if left > 0 {
            self.world.insert(target, s.health, ComponentValue::from_u32(left));
            return;
        }

        // knocked out: back to full health at the spawn point
        let player = self
            .world
            .get(target, s.controller)
            .and_then(ComponentValue::as_u32)
            .unwrap_or(0) as PlayerId;
        let respawn = self.spawn_point(player);
        self.world
            .insert(target, s.health, ComponentValue::from_u32(self.rules.max_health));
        self.world.insert(target, s.position, ComponentValue::from_vec3(respawn));
    }

    fn position(&self, id: NetworkId) -> Option<Vec3> {
        self.world.get(id, self.schema.position)?.as_vec3()
    }

    fn record_colliders(&mut self, tick: Tick) {
        let mut frames = Vec::with_capacity(self.avatars.len() + self.bots.len());
        for &avatar in self.avatars.values() {
            if let Some(at) = self.position(avatar) {
                let hitbox = Hitbox::Sphere { radius: 0.6 };
                let frame = ColliderFrame::new(Transform::from_translation(at + BODY_CENTER), hitbox)
                    .with_flags(FrameFlags::PLAYER_CONTROLLED);
                frames.push((avatar, frame));
            }
        }
        for &bot in &self.bots {
            if let Some(at) = self.position(bot) {
                let hitbox = Hitbox::Box {
                    half_extents: Vec3::new(0.5, 1.0, 0.5),
                };
                frames.push((bot, ColliderFrame::new(Transform::from_translation(at + BODY_CENTER), hitbox)));
            }
        }
        for (id, frame) in &frames {
            self.world
                .set_extent(*id, Some(frame.hitbox.bounds(&frame.transform)));
        }
        self.replicator.record_colliders(tick, frames);
    }

    fn send_updates(&mut self) {
        let updates = self.replicator.build_updates(&self.world, &AlwaysRelevant);
        for update in updates {
            let Some(addr) = self.connections.get(update.client).map(|c| c.addr) else {
                continue;
            };
            for fragment in update.fragments {
                match self.endpoint.send_to(PacketType::Update(fragment), addr) {
                    Ok((seq, evicted)) => {
                        self.replicator.register_sent(update.client, update.update_seq, seq);
                        for (old, outcome) in evicted {
                            self.replicator.handle_delivery(update.client, old, outcome);
                        }
                    }
                    Err(e) => {
                        warn!("{}: update {} not sent: {e}", update.client, update.update_seq);
                        self.replicator.update_unsent(update.client, update.update_seq);
                        break;
                    }
                }
            }
        }
    }
}

fn avatar_owner(player: Option<PlayerId>) -> Option<OwnerTag> {
    player.and_then(|p| OwnerTag::player(p).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera::ComponentSource;

    #[test]
    fn test_failed_stage_keeps_changes_for_next_tick() {
        let endpoint = NetworkEndpoint::bind("127.0.0.1:0").unwrap();
        let mut server = ArenaServer::new(endpoint, ServerConfig::default(), 1).unwrap();
        let bot = server.bots[0];
        let health = server.schema.health;
        server.tick();
        assert!(server.world.changed_components().is_empty());

        server.world.insert(bot, health, ComponentValue::from_vec3(Vec3::ONE));
        server.tick();
        let events: Vec<ServerEvent> = server.drain_events().collect();
        assert!(matches!(events.as_slice(), [ServerEvent::Error { .. }]));
        assert!(server.world.changed_components().contains(&(bot, health)));

        server.world.insert(bot, health, ComponentValue::from_u32(40));
        server.tick();
        assert_eq!(server.drain_events().count(), 0);
        assert!(server.world.changed_components().is_empty());
        assert_eq!(server.replicator.tick(), server.tick);
    }
}
