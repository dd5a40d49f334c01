//! ChatServer Actor implementation
//!
//! The room directory: maps room codes to running RoomCoordinator actors,
//! spawning a room the first time it is asked for. Room state itself lives
//! in the room actors, so rooms process their traffic in parallel.
//! A room that ends up with no members and no history retires its actor;
//! the directory forgets it and opens a fresh one on the next request.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::error::AppError;
use crate::room::{RoomCoordinator, RoomHandle};
use crate::types::RoomCode;

/// Commands sent from connection handlers to the ChatServer actor
#[derive(Debug)]
pub enum ServerCommand {
    /// Get or create the room with the given code
    OpenRoom {
        code: RoomCode,
        reply: oneshot::Sender<RoomHandle>,
    },
    /// List the codes of all live rooms
    ListRooms {
        reply: oneshot::Sender<Vec<RoomCode>>,
    },
}

/// Cloneable client of the ChatServer actor
#[derive(Debug, Clone)]
pub struct ServerHandle {
    commands: mpsc::Sender<ServerCommand>,
}

impl ServerHandle {
    /// Get or create a room
    pub async fn open_room(&self, code: RoomCode) -> Result<RoomHandle, AppError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ServerCommand::OpenRoom { code, reply })
            .await
            .map_err(|_| AppError::ChannelSend)?;
        rx.await.map_err(|_| AppError::ChannelSend)
    }

    pub async fn list_rooms(&self) -> Result<Vec<RoomCode>, AppError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ServerCommand::ListRooms { reply })
            .await
            .map_err(|_| AppError::ChannelSend)?;
        rx.await.map_err(|_| AppError::ChannelSend)
    }
}

/// The room directory actor
pub struct ChatServer {
    config: ServerConfig,
    /// All opened rooms: RoomCode -> RoomHandle
    rooms: HashMap<RoomCode, RoomHandle>,
    /// Command receiver channel
    receiver: mpsc::Receiver<ServerCommand>,
}

impl ChatServer {
    /// Create a new ChatServer with the given command receiver
    pub fn new(config: ServerConfig, receiver: mpsc::Receiver<ServerCommand>) -> Self {
        Self {
            config,
            rooms: HashMap::new(),
            receiver,
        }
    }

    /// Start the actor and return a handle to it
    pub fn spawn(config: ServerConfig) -> ServerHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.room_buffer);
        tokio::spawn(Self::new(config, cmd_rx).run());
        ServerHandle { commands: cmd_tx }
    }

    /// Run the ChatServer event loop
    ///
    /// Continuously receives and processes commands until all senders are dropped.
    pub async fn run(mut self) {
        info!("ChatServer started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!("ChatServer shutting down");
    }

    /// Process a single command
    fn handle_command(&mut self, cmd: ServerCommand) {
        match cmd {
            ServerCommand::OpenRoom { code, reply } => {
                let room = self.open_room(code);
                let _ = reply.send(room);
            }
            ServerCommand::ListRooms { reply } => {
                self.prune();
                let mut codes: Vec<RoomCode> = self.rooms.keys().cloned().collect();
                codes.sort_by(|a, b| a.0.cmp(&b.0));
                let _ = reply.send(codes);
            }
        }
    }

    fn open_room(&mut self, code: RoomCode) -> RoomHandle {
        match self.rooms.get(&code) {
            Some(room) if !room.is_closed() => return room.clone(),
            Some(_) => debug!("Room {} retired, replacing it", code),
            None => {}
        }
        self.prune();

        let room = RoomCoordinator::spawn(code.clone(), self.config);
        self.rooms.insert(code.clone(), room.clone());
        info!("Room {} opened", code);
        debug!("Total rooms: {}", self.rooms.len());
        room
    }

    /// Forget rooms whose actor has retired
    fn prune(&mut self) {
        let before = self.rooms.len();
        self.rooms.retain(|_, room| !room.is_closed());
        if self.rooms.len() != before {
            debug!("Pruned {} retired rooms", before - self.rooms.len());
        }
    }
}
