use std::net::SocketAddr;

use tessera::{ClientId, NetworkId, PlayerId};

#[derive(Debug, Clone)]
pub enum ServerEvent {
    ClientConnected {
        client: ClientId,
        addr: SocketAddr,
        player: PlayerId,
        avatar: NetworkId,
    },
    ClientDisconnected {
        client: ClientId,
        reason: DisconnectReason,
    },
    ConnectionDenied {
        addr: SocketAddr,
        reason: String,
    },
    Hit {
        shooter: NetworkId,
        target: NetworkId,
        rewound: u32,
        mitigated: bool,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy)]
pub enum DisconnectReason {
    Graceful,
    Timeout,
    Shutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Shutdown => "dropped at shutdown",
        }
    }
}
