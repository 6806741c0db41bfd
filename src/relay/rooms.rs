//! Live room membership for the relay.
//!
//! Membership changes happen under one lock; forwarding happens after the lock is released,
//! over a snapshot of the recipients, so a disconnect can never race a broadcast iteration.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::Message;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::signaling::protocol::{leave_frame, Envelope};

pub type ConnId = u64;
pub type ConnTx = mpsc::UnboundedSender<Message>;

struct Member {
    room_id: Option<String>,
    sender_id: Option<String>,
    tx: ConnTx,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnId, Member>,
    rooms: HashMap<String, HashSet<ConnId>>,
}

impl Inner {
    fn detach(&mut self, conn: ConnId, room_id: &str) {
        if let Some(members) = self.rooms.get_mut(room_id) {
            members.remove(&conn);
            if members.is_empty() {
                self.rooms.remove(room_id);
                info!("Room {} is empty, removed", room_id);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub rooms: usize,
    pub connections: usize,
}

#[derive(Default)]
pub struct RoomRegistry {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly accepted transport. It belongs to no room until it sends a `roomId`.
    pub async fn register(&self, tx: ConnTx) -> ConnId {
        let conn = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.lock().await.connections.insert(
            conn,
            Member {
                room_id: None,
                sender_id: None,
                tx,
            },
        );
        conn
    }

    /// Forward `raw` according to its envelope. Returns the number of transports it was
    /// queued on.
    pub async fn route(&self, conn: ConnId, envelope: &Envelope, raw: &str) -> usize {
        let Some(ref room_id) = envelope.room_id else {
            debug!("Dropping {} from connection {} without roomId", envelope.kind, conn);
            return 0;
        };

        let recipients: Vec<ConnTx> = {
            let mut inner = self.inner.lock().await;

            let previous = match inner.connections.get_mut(&conn) {
                Some(member) => {
                    if let Some(ref sender_id) = envelope.sender_id {
                        member.sender_id = Some(sender_id.clone());
                    }
                    if member.room_id.as_deref() == Some(room_id.as_str()) {
                        None
                    } else {
                        Some(member.room_id.replace(room_id.clone()))
                    }
                }
                None => {
                    warn!("Frame from unregistered connection {}", conn);
                    return 0;
                }
            };

            if let Some(previous) = previous {
                if let Some(ref old_room) = previous {
                    debug!("Connection {} moved from room {} to {}", conn, old_room, room_id);
                    inner.detach(conn, old_room);
                }
                let members = inner.rooms.entry(room_id.clone()).or_insert_with(|| {
                    info!("Room {} created", room_id);
                    HashSet::new()
                });
                members.insert(conn);
            }

            let Some(members) = inner.rooms.get(room_id) else {
                return 0;
            };

            members
                .iter()
                .filter(|&&id| id != conn)
                .filter_map(|id| inner.connections.get(id))
                .filter(|member| match envelope.target_id {
                    Some(ref target) => member.sender_id.as_deref() == Some(target.as_str()),
                    None => true,
                })
                .map(|member| member.tx.clone())
                .collect()
        };

        let mut delivered = 0;
        for tx in recipients {
            if tx.send(Message::Text(raw.to_string())).is_ok() {
                delivered += 1;
            }
        }

        if delivered == 0 && envelope.target_id.is_some() {
            debug!(
                "No recipient for {} targeted at {:?} in room {}",
                envelope.kind, envelope.target_id, room_id
            );
        }
        delivered
    }

    /// Remove a transport. If it had joined a room under a known sender id, the remaining
    /// members receive a `leave` on its behalf.
    pub async fn unregister(&self, conn: ConnId) {
        let (room_id, sender_id, recipients) = {
            let mut inner = self.inner.lock().await;
            let Some(member) = inner.connections.remove(&conn) else {
                return;
            };
            let Some(room_id) = member.room_id else {
                return;
            };
            inner.detach(conn, &room_id);

            let recipients: Vec<ConnTx> = inner
                .rooms
                .get(&room_id)
                .map(|members| {
                    members
                        .iter()
                        .filter_map(|id| inner.connections.get(id))
                        .map(|m| m.tx.clone())
                        .collect()
                })
                .unwrap_or_default();
            (room_id, member.sender_id, recipients)
        };

        let Some(sender_id) = sender_id else {
            return;
        };
        info!("{} left room {}", sender_id, room_id);

        match leave_frame(&room_id, &sender_id) {
            Ok(frame) => {
                for tx in recipients {
                    let _ = tx.send(Message::Text(frame.clone()));
                }
            }
            Err(e) => warn!("Failed to build leave frame: {}", e),
        }
    }

    pub async fn stats(&self) -> RelayStats {
        let inner = self.inner.lock().await;
        RelayStats {
            rooms: inner.rooms.len(),
            connections: inner.connections.len(),
        }
    }

    pub async fn room_size(&self, room_id: &str) -> usize {
        self.inner
            .lock()
            .await
            .rooms
            .get(room_id)
            .map_or(0, |members| members.len())
    }
}
