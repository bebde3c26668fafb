use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Result;

use tessera::net::ConnectionState;
use tessera::{
    ClientConfig, ClientEvent, ClientReplicator, NetworkEndpoint, PacketType, PlayerId,
    PredictionTag, Tick,
};
use tessera_arena::{ArenaInput, ArenaRules, ArenaSchema, ArenaSim, Buttons};

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub fire_every: u32,
    pub throw_every: u32,
    pub connection_timeout_secs: u64,
    pub request_interval: Duration,
    pub ping_interval: Duration,
    pub stats_interval: Duration,
    pub client: ClientConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            fire_every: 30,
            throw_every: 90,
            connection_timeout_secs: 10,
            request_interval: Duration::from_millis(250),
            ping_interval: Duration::from_secs(1),
            stats_interval: Duration::from_secs(5),
            client: ClientConfig::default(),
        }
    }
}

struct Session {
    player: PlayerId,
    replicator: ClientReplicator<ArenaSim>,
    sim: ArenaSim,
    rollbacks: usize,
}

/// Scripted player: connects, walks in circles, shoots and throws on a fixed
/// cadence, and keeps its prediction in sync with the server.
pub struct BotClient {
    endpoint: NetworkEndpoint,
    config: BotConfig,
    schema: ArenaSchema,
    state: ConnectionState,
    session: Option<Session>,
    started: Instant,
    connection_start_time: Option<Instant>,
    last_request_time: Instant,
    last_ping_time: Instant,
    last_stats_time: Instant,
    rtt_ms: Option<u64>,
    running: bool,
}

impl BotClient {
    pub fn new(config: BotConfig) -> Result<Self> {
        let mut endpoint = NetworkEndpoint::bind("0.0.0.0:0")?;
        endpoint.set_timeout(Duration::from_secs(config.connection_timeout_secs));
        let now = Instant::now();

        Ok(Self {
            endpoint,
            schema: ArenaSchema::new()?,
            state: ConnectionState::Disconnected,
            session: None,
            started: now,
            connection_start_time: None,
            last_request_time: now,
            last_ping_time: now,
            last_stats_time: now,
            rtt_ms: None,
            running: true,
            config,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn connect(&mut self, server_addr: SocketAddr) -> Result<()> {
        log::info!("Connecting to {}", server_addr);

        self.endpoint.set_remote(server_addr);
        self.state = ConnectionState::Connecting;
        self.connection_start_time = Some(Instant::now());
        self.send_connection_request()
    }

    pub fn disconnect(&mut self) {
        if self.state == ConnectionState::Connected {
            let _ = self.endpoint.send(PacketType::Disconnect);
        }
        self.state = ConnectionState::Disconnected;
        self.session = None;
    }

    fn send_connection_request(&mut self) -> Result<()> {
        self.endpoint.send(PacketType::ConnectionRequest)?;
        self.last_request_time = Instant::now();
        Ok(())
    }

    pub fn update(&mut self, dt: f32) -> Result<()> {
        self.process_network()?;

        match self.state {
            ConnectionState::Connecting => {
                if self
                    .connection_start_time
                    .is_some_and(|start| start.elapsed() > Duration::from_secs(self.config.connection_timeout_secs))
                {
                    log::warn!("Connection timeout");
                    self.running = false;
                } else if self.last_request_time.elapsed() >= self.config.request_interval {
                    self.send_connection_request()?;
                }
            }
            ConnectionState::Connected => {
                if self.endpoint.is_timed_out() {
                    log::warn!("Server stopped responding");
                    self.running = false;
                    return Ok(());
                }
                self.predict(dt)?;
                if self.last_ping_time.elapsed() >= self.config.ping_interval {
                    let timestamp = self.started.elapsed().as_millis() as u64;
                    self.endpoint.send(PacketType::Ping { timestamp })?;
                    self.last_ping_time = Instant::now();
                }
                if self.last_stats_time.elapsed() >= self.config.stats_interval {
                    self.log_stats();
                    self.last_stats_time = Instant::now();
                }
            }
            ConnectionState::Disconnected | ConnectionState::Disconnecting => {}
        }
        Ok(())
    }

    fn predict(&mut self, dt: f32) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let config = &self.config;
        let frame = session
            .replicator
            .advance(&mut session.sim, dt, |tick| scripted_input(config, tick));
        session.rollbacks += frame.steps.iter().filter(|s| s.rolled_back).count();
        if !frame.inputs.is_empty() {
            self.endpoint.send(PacketType::Input(frame.inputs))?;
        }
        Ok(())
    }

    fn process_network(&mut self) -> Result<()> {
        for received in self.endpoint.receive()? {
            self.handle_payload(received.packet.payload)?;
        }
        Ok(())
    }

    fn handle_payload(&mut self, payload: PacketType) -> Result<()> {
        match payload {
            PacketType::ConnectionAccepted {
                client_id,
                player_id,
                server_tick,
                tick_rate,
            } => self.handle_connection_accepted(client_id, player_id, server_tick, tick_rate)?,
            PacketType::ConnectionDenied { reason } => {
                log::warn!("Connection denied: {reason}");
                self.running = false;
            }
            PacketType::Update(fragment) => {
                let arrival = self.started.elapsed().as_secs_f64();
                let Some(session) = self.session.as_mut() else {
                    return Ok(());
                };
                if let Some(event) = session.replicator.receive_fragment(fragment, arrival) {
                    self.handle_event(event)?;
                }
            }
            PacketType::Pong { timestamp } => {
                let now = self.started.elapsed().as_millis() as u64;
                self.rtt_ms = Some(now.saturating_sub(timestamp));
            }
            PacketType::Disconnect => {
                log::info!("Disconnected by server");
                self.state = ConnectionState::Disconnected;
                self.running = false;
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_connection_accepted(
        &mut self,
        client_id: u32,
        player_id: PlayerId,
        server_tick: Tick,
        tick_rate: u32,
    ) -> Result<()> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }
        log::info!("Connected as client {client_id}, player {player_id} (server tick {server_tick}, {tick_rate} Hz)");

        let mut config = self.config.client.clone();
        config.clock.tick_rate = tick_rate;
        let rules = ArenaRules {
            tick_rate,
            ..Default::default()
        };
        self.session = Some(Session {
            player: player_id,
            replicator: ClientReplicator::new(self.schema.registry.clone(), player_id, config)?,
            sim: ArenaSim::new(self.schema.clone(), rules, player_id),
            rollbacks: 0,
        });
        self.state = ConnectionState::Connected;
        Ok(())
    }

    fn handle_event(&mut self, event: ClientEvent) -> Result<()> {
        match &event {
            ClientEvent::Applied { tick, kind, entities } => {
                log::debug!("applied {kind:?} for tick {tick} ({entities} entities)")
            }
            ClientEvent::Late { tick, merged } => {
                log::debug!("late update for tick {tick}, {merged} entries still current")
            }
            ClientEvent::Malformed { error, .. } => log::warn!("malformed update: {error}"),
            ClientEvent::ResyncRequested { last_good_tick } => {
                log::warn!("requesting resync (last good tick {last_good_tick:?})")
            }
            ClientEvent::Terminated { error } => {
                log::error!("giving up on the server: {error}");
                self.running = false;
            }
        }
        if let Some(response) = event.response() {
            self.endpoint.send(response)?;
        }
        Ok(())
    }

    fn log_stats(&self) {
        let Some(session) = &self.session else {
            return;
        };
        let prediction = session.replicator.prediction();
        let lost = self.endpoint.stats().packets_lost;
        log::info!(
            "player {}: predicted tick {:?}, confirmed tick {:?}, {} entities, {} predicted, {} cancelled, {} rollbacks, rtt {:?} ms, {} packets lost",
            session.player,
            session.replicator.clock().predicted_tick(),
            prediction.confirmed_tick(),
            prediction.confirmed().len(),
            prediction.units_with(PredictionTag::Predicted).len(),
            prediction.units_with(PredictionTag::Cancelled).len(),
            session.rollbacks,
            self.rtt_ms,
            lost,
        );
    }
}

/// Walks a slow circle; shots and throws land on fixed tick multiples so a
/// replay of the same tick reproduces them.
fn scripted_input(config: &BotConfig, tick: Tick) -> ArenaInput {
    let angle = tick as f32 * 0.02;
    let mut buttons = Buttons::empty();
    if config.fire_every > 0 && tick % config.fire_every == 0 {
        buttons |= Buttons::FIRE;
    }
    if config.throw_every > 0 && tick % config.throw_every == 0 {
        buttons |= Buttons::THROW;
    }
    ArenaInput {
        buttons,
        move_x: (angle.cos() * i8::MAX as f32) as i8,
        move_z: (angle.sin() * i8::MAX as f32) as i8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_input_cadence() {
        let config = BotConfig {
            fire_every: 3,
            throw_every: 0,
            ..Default::default()
        };
        assert!(scripted_input(&config, 9).buttons.contains(Buttons::FIRE));
        assert!(scripted_input(&config, 10).buttons.is_empty());
        assert!((0..100).all(|t| !scripted_input(&config, t).buttons.contains(Buttons::THROW)));
        assert_eq!(scripted_input(&config, 7), scripted_input(&config, 7));
    }
}
