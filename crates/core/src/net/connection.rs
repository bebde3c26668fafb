use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::id::{ClientId, OwnerTag, PlayerId};

const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("server full")]
    ServerFull,
    #[error("no player ids left")]
    PlayersExhausted,
}

#[derive(Debug)]
pub struct ClientConnection {
    pub addr: SocketAddr,
    pub client_id: ClientId,
    pub player_id: PlayerId,
    pub state: ConnectionState,
    pub last_receive_time: Instant,
}

impl ClientConnection {
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_receive_time.elapsed() > timeout
    }

    pub fn touch(&mut self) {
        self.last_receive_time = Instant::now();
    }
}

/// Server-side connection table. Hands out client handles and the player
/// owner tags their predicted IDs are scoped to.
#[derive(Debug)]
pub struct ConnectionManager {
    clients_by_addr: HashMap<SocketAddr, ClientId>,
    clients: HashMap<ClientId, ClientConnection>,
    free_players: BTreeSet<PlayerId>,
    next_client_id: u32,
    max_clients: usize,
    timeout: Duration,
}

impl ConnectionManager {
    pub fn new(max_clients: usize) -> Self {
        Self::with_timeout(max_clients, DEFAULT_TIMEOUT_SECS)
    }

    pub fn with_timeout(max_clients: usize, timeout_secs: u64) -> Self {
        Self {
            clients_by_addr: HashMap::new(),
            clients: HashMap::new(),
            free_players: (1..=OwnerTag::MAX_PLAYER).collect(),
            next_client_id: 1,
            max_clients,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Returns the existing connection for `addr` or admits a new one.
    pub fn get_or_accept(&mut self, addr: SocketAddr) -> Result<&mut ClientConnection, ConnectError> {
        if let Some(&client_id) = self.clients_by_addr.get(&addr) {
            return self.clients.get_mut(&client_id).ok_or(ConnectError::ServerFull);
        }

        if self.clients.len() >= self.max_clients {
            return Err(ConnectError::ServerFull);
        }
        let player_id = self.free_players.pop_first().ok_or(ConnectError::PlayersExhausted)?;

        let client_id = ClientId(self.next_client_id);
        self.next_client_id += 1;

        self.clients_by_addr.insert(addr, client_id);
        let connection = self.clients.entry(client_id).or_insert(ClientConnection {
            addr,
            client_id,
            player_id,
            state: ConnectionState::Connecting,
            last_receive_time: Instant::now(),
        });
        Ok(connection)
    }

    pub fn get_by_addr(&self, addr: &SocketAddr) -> Option<&ClientConnection> {
        self.clients_by_addr
            .get(addr)
            .and_then(|id| self.clients.get(id))
    }

    pub fn get_by_addr_mut(&mut self, addr: &SocketAddr) -> Option<&mut ClientConnection> {
        let id = self.clients_by_addr.get(addr)?;
        self.clients.get_mut(id)
    }

    pub fn get(&self, client_id: ClientId) -> Option<&ClientConnection> {
        self.clients.get(&client_id)
    }

    pub fn remove(&mut self, client_id: ClientId) -> Option<ClientConnection> {
        let conn = self.clients.remove(&client_id)?;
        self.clients_by_addr.remove(&conn.addr);
        self.free_players.insert(conn.player_id);
        Some(conn)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientConnection> {
        self.clients.values()
    }

    pub fn cleanup_timed_out(&mut self) -> Vec<ClientConnection> {
        let timed_out: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, c)| c.is_timed_out(self.timeout))
            .map(|(&id, _)| id)
            .collect();

        timed_out.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn connected_count(&self) -> usize {
        self.clients
            .values()
            .filter(|c| c.state == ConnectionState::Connected)
            .count()
    }
}
