//! Room adapter
//!
//! Keeps room membership for one namespace and fans packets out to the
//! members of a set of rooms.

use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::Outbox;
use crate::server::Packet;

/// Targeting for a broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastOptions {
    /// Rooms to reach; empty means every socket in the namespace
    pub rooms: Vec<String>,
    /// Socket ids to skip
    pub except: Vec<String>,
    /// Drop the packet for peers that cannot take it right now
    pub volatile: bool,
}

#[derive(Debug, Default)]
struct AdapterState {
    /// room -> member socket ids
    rooms: HashMap<String, HashSet<String>>,
    /// socket id -> rooms joined
    sids: HashMap<String, HashSet<String>>,
    /// socket id -> outbound channel
    outboxes: HashMap<String, Outbox>,
}

/// In-memory room registry for a namespace
#[derive(Debug, Default)]
pub struct Adapter {
    state: RwLock<AdapterState>,
}

impl Adapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket's outbound channel
    pub fn register(&self, id: &str, outbox: Outbox) {
        self.state.write().outboxes.insert(id.to_string(), outbox);
    }

    /// Add a socket to a room
    pub fn add(&self, id: &str, room: &str) {
        let mut state = self.state.write();
        state
            .sids
            .entry(id.to_string())
            .or_default()
            .insert(room.to_string());
        state
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(id.to_string());
    }

    /// Remove a socket from a room; empty rooms are dropped
    pub fn remove(&self, id: &str, room: &str) {
        let mut state = self.state.write();
        if let Some(rooms) = state.sids.get_mut(id) {
            rooms.remove(room);
        }
        if let Some(members) = state.rooms.get_mut(room) {
            members.remove(id);
            if members.is_empty() {
                state.rooms.remove(room);
            }
        }
    }

    /// Remove a socket from every room and forget its outbound channel
    pub fn remove_all(&self, id: &str) {
        let mut state = self.state.write();
        state.outboxes.remove(id);
        let Some(rooms) = state.sids.remove(id) else {
            return;
        };
        for room in rooms {
            if let Some(members) = state.rooms.get_mut(&room) {
                members.remove(id);
                if members.is_empty() {
                    state.rooms.remove(&room);
                }
            }
        }
    }

    /// Socket ids in a room, sorted
    pub fn members(&self, room: &str) -> Vec<String> {
        let state = self.state.read();
        let mut members: Vec<String> = state
            .rooms
            .get(room)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Number of sockets registered with the adapter
    pub fn socket_count(&self) -> usize {
        self.state.read().outboxes.len()
    }

    /// Send a packet to every targeted socket. Returns how many sockets it
    /// was queued for.
    pub fn broadcast(&self, packet: &Packet, opts: &BroadcastOptions) -> usize {
        let state = self.state.read();

        let targets: BTreeSet<&String> = if opts.rooms.is_empty() {
            state.outboxes.keys().collect()
        } else {
            opts.rooms
                .iter()
                .filter_map(|room| state.rooms.get(room))
                .flatten()
                .collect()
        };

        let mut delivered = 0;
        for id in targets {
            if opts.except.iter().any(|except| except == id) {
                continue;
            }
            let Some(outbox) = state.outboxes.get(id) else {
                continue;
            };
            match outbox.deliver(packet.clone(), opts.volatile) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Broadcast to socket {} failed: {}", id, e),
            }
        }

        debug!(
            "Broadcast to rooms {:?} reached {} sockets",
            opts.rooms, delivered
        );
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Outbound;

    fn registered(adapter: &Adapter, id: &str) -> tokio::sync::mpsc::Receiver<Outbound> {
        let (outbox, rx) = Outbox::channel(8);
        adapter.register(id, outbox);
        rx
    }

    #[test]
    fn test_add_and_remove() {
        let adapter = Adapter::new();
        adapter.add("a", "lobby");
        adapter.add("b", "lobby");
        assert_eq!(adapter.members("lobby"), vec!["a", "b"]);

        adapter.remove("a", "lobby");
        assert_eq!(adapter.members("lobby"), vec!["b"]);

        adapter.remove("b", "lobby");
        assert!(adapter.members("lobby").is_empty());
    }

    #[test]
    fn test_remove_all() {
        let adapter = Adapter::new();
        let _rx = registered(&adapter, "a");
        adapter.add("a", "one");
        adapter.add("a", "two");
        assert_eq!(adapter.socket_count(), 1);

        adapter.remove_all("a");
        assert!(adapter.members("one").is_empty());
        assert!(adapter.members("two").is_empty());
        assert_eq!(adapter.socket_count(), 0);
    }

    #[test]
    fn test_broadcast_to_room_skips_except() {
        let adapter = Adapter::new();
        let mut rx_a = registered(&adapter, "a");
        let mut rx_b = registered(&adapter, "b");
        let mut rx_c = registered(&adapter, "c");
        adapter.add("a", "lobby");
        adapter.add("b", "lobby");

        let packet = Packet::event("/", "chat", vec![], None);
        let opts = BroadcastOptions {
            rooms: vec!["lobby".to_string()],
            except: vec!["a".to_string()],
            volatile: false,
        };
        assert_eq!(adapter.broadcast(&packet, &opts), 1);

        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), Outbound::Packet(packet));
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_without_rooms_reaches_everyone() {
        let adapter = Adapter::new();
        let _rx_a = registered(&adapter, "a");
        let _rx_b = registered(&adapter, "b");

        let packet = Packet::event("/", "news", vec![], None);
        assert_eq!(adapter.broadcast(&packet, &BroadcastOptions::default()), 2);
    }

    #[test]
    fn test_broadcast_counts_socket_once_across_rooms() {
        let adapter = Adapter::new();
        let mut rx = registered(&adapter, "a");
        adapter.add("a", "one");
        adapter.add("a", "two");

        let packet = Packet::event("/", "ping", vec![], None);
        let opts = BroadcastOptions {
            rooms: vec!["one".to_string(), "two".to_string()],
            ..Default::default()
        };
        assert_eq!(adapter.broadcast(&packet, &opts), 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
