//! Realtime socket
//!
//! A `Socket` is one client's presence in one namespace. It tracks the rooms it
//! joined, the acknowledgements it is waiting for, and the flags that apply to
//! its next emit.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use http::header::{HeaderMap, ORIGIN};
use serde_json::Value;
use tracing::{debug, info};

use super::{
    Adapter, BroadcastOptions, Client, Conn, HandshakeRequest, Namespace, Server,
    TransportError, TransportResult, ROOT_NAMESPACE,
};
use crate::context::Query;
use crate::server::Packet;

/// Event names a socket may not emit to its client
pub const RESERVED_EVENTS: &[&str] = &[
    "connect",
    "connect_error",
    "disconnect",
    "disconnecting",
    "error",
    "newListener",
    "removeListener",
];

/// Callback run when the client acknowledges an event
pub type AckCallback = Box<dyn FnOnce(Vec<Value>) + Send>;

/// Modifiers for the next emit; reset after every emit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub json: bool,
    pub volatile: bool,
    pub broadcast: bool,
}

/// Handshake details captured when the socket was created
#[derive(Debug, Clone)]
pub struct Handshake {
    pub headers: HeaderMap,
    /// Creation time, RFC 2822
    pub time: String,
    pub address: Option<String>,
    /// Whether the request carried an `Origin` header
    pub xdomain: bool,
    pub secure: bool,
    /// Creation time, milliseconds since the Unix epoch
    pub issued: i64,
    pub url: String,
    pub query: Query,
}

impl Handshake {
    fn capture(client: &Client) -> Self {
        let request = client.request();
        let now = Utc::now();
        Self {
            headers: request.headers().clone(),
            time: now.to_rfc2822(),
            address: client.conn().remote_address().map(str::to_owned),
            xdomain: request.headers().contains_key(ORIGIN),
            secure: request.connection().encrypted,
            issued: now.timestamp_millis(),
            url: request.url().to_string(),
            query: Query::parse(request.uri().query().unwrap_or("")),
        }
    }
}

/// One client's membership in a namespace
pub struct Socket {
    id: String,
    nsp: Arc<Namespace>,
    client: Arc<Client>,
    rooms: Vec<String>,
    acks: HashMap<u64, AckCallback>,
    next_ack_id: u64,
    flags: Flags,
    connected: bool,
    handshake: Handshake,
}

impl Socket {
    /// Create a socket for `client` in `nsp`.
    ///
    /// The socket registers with the namespace adapter and joins the room named
    /// after its own id.
    pub fn new(nsp: Arc<Namespace>, client: Arc<Client>) -> Self {
        let id = if nsp.name() == ROOT_NAMESPACE {
            client.id().to_string()
        } else {
            format!("{}#{}", nsp.name(), client.id())
        };

        nsp.adapter().register(&id, client.conn().outbox().clone());

        let mut socket = Self {
            handshake: Handshake::capture(&client),
            id: id.clone(),
            nsp,
            client,
            rooms: Vec::new(),
            acks: HashMap::new(),
            next_ack_id: 0,
            flags: Flags::default(),
            connected: true,
        };
        socket.join(id);

        debug!("Socket {} created in namespace {}", socket.id, socket.nsp.name());
        socket
    }

    /// Socket id; `nsp#client` outside the root namespace
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Namespace the socket belongs to
    pub fn nsp(&self) -> &Arc<Namespace> {
        &self.nsp
    }

    /// Client the socket was created for
    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Options of the owning server
    pub fn server(&self) -> &Arc<Server> {
        self.nsp.server()
    }

    /// Room adapter of the namespace
    pub fn adapter(&self) -> &Arc<Adapter> {
        self.nsp.adapter()
    }

    /// The handshake request that opened the connection
    pub fn request(&self) -> &HandshakeRequest {
        self.client.request()
    }

    /// The low-level connection
    pub fn conn(&self) -> &Conn {
        self.client.conn()
    }

    /// Rooms joined, in join order
    pub fn rooms(&self) -> &[String] {
        &self.rooms
    }

    /// Acknowledgements waiting for the client, by packet id
    pub fn acks(&self) -> &HashMap<u64, AckCallback> {
        &self.acks
    }

    /// Whether the next emit is flagged as JSON
    pub fn json(&self) -> bool {
        self.flags.json
    }

    /// Whether the next emit may be dropped under pressure
    pub fn volatile(&self) -> bool {
        self.flags.volatile
    }

    /// Flags applying to the next emit
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Replace the flags for the next emit
    pub fn set_flags(&mut self, flags: Flags) {
        self.flags = flags;
    }

    /// Whether the socket is still in its namespace
    pub fn connected(&self) -> bool {
        self.connected
    }

    /// Inverse of [`Socket::connected`]
    pub fn disconnected(&self) -> bool {
        !self.connected
    }

    /// Details captured at creation
    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// Operator emitting to every other socket in the namespace
    pub fn broadcast(&mut self) -> BroadcastOperator {
        let flags = std::mem::take(&mut self.flags);
        BroadcastOperator::new(Arc::clone(&self.nsp), self.id.clone(), flags)
    }

    /// Operator emitting to the members of `room`, except this socket
    pub fn to(&mut self, room: impl Into<String>) -> BroadcastOperator {
        self.broadcast().to(room)
    }

    /// Alias of [`Socket::to`]
    pub fn in_(&mut self, room: impl Into<String>) -> BroadcastOperator {
        self.to(room)
    }

    /// Join a room
    pub fn join(&mut self, room: impl Into<String>) -> &mut Self {
        let room = room.into();
        if !self.rooms.contains(&room) {
            self.nsp.adapter().add(&self.id, &room);
            debug!("Socket {} joined room {}", self.id, room);
            self.rooms.push(room);
        }
        self
    }

    /// Leave a room
    pub fn leave(&mut self, room: &str) -> &mut Self {
        if let Some(pos) = self.rooms.iter().position(|r| r == room) {
            self.nsp.adapter().remove(&self.id, room);
            self.rooms.remove(pos);
            debug!("Socket {} left room {}", self.id, room);
        }
        self
    }

    fn leave_all(&mut self) {
        self.nsp.adapter().remove_all(&self.id);
        self.rooms.clear();
    }

    /// Emit an event to the client, or to the targeted sockets when the
    /// broadcast flag is set.
    pub fn emit(&mut self, event: &str, args: Vec<Value>) -> TransportResult<()> {
        check_reserved(event)?;
        let flags = std::mem::take(&mut self.flags);
        if flags.broadcast {
            BroadcastOperator::new(Arc::clone(&self.nsp), self.id.clone(), flags)
                .emit(event, args)?;
            return Ok(());
        }

        let packet = Packet::event(self.nsp.name(), event, args, None);
        self.packet(packet, flags.volatile)
    }

    /// Emit an event and run `ack` when the client acknowledges it.
    ///
    /// Returns the packet id the acknowledgement is registered under.
    pub fn emit_with_ack<F>(&mut self, event: &str, args: Vec<Value>, ack: F) -> TransportResult<u64>
    where
        F: FnOnce(Vec<Value>) + Send + 'static,
    {
        check_reserved(event)?;
        let flags = std::mem::take(&mut self.flags);
        if flags.broadcast {
            return Err(TransportError::AckWhileBroadcasting);
        }

        let id = self.next_ack_id;
        let packet = Packet::event(self.nsp.name(), event, args, Some(id));
        self.packet(packet, flags.volatile)?;

        self.next_ack_id += 1;
        self.acks.insert(id, Box::new(ack));
        debug!("Socket {} waiting for ack {}", self.id, id);
        Ok(id)
    }

    /// Emit a `message` event
    pub fn send(&mut self, args: Vec<Value>) -> TransportResult<()> {
        self.emit("message", args)
    }

    /// Alias of [`Socket::send`]
    pub fn write(&mut self, args: Vec<Value>) -> TransportResult<()> {
        self.send(args)
    }

    /// Acknowledge a client event
    pub fn ack(&self, id: u64, data: Vec<Value>) -> TransportResult<()> {
        self.packet(Packet::ack(self.nsp.name(), id, data), false)
    }

    /// Report an error to the client
    pub fn error(&self, message: impl Into<String>) -> TransportResult<()> {
        self.packet(Packet::error(self.nsp.name(), message), false)
    }

    /// Run the callback registered for acknowledgement `id`.
    ///
    /// Returns `false` when nothing was waiting for it.
    pub fn on_ack(&mut self, id: u64, data: Vec<Value>) -> bool {
        match self.acks.remove(&id) {
            Some(ack) => {
                debug!("Socket {} received ack {}", self.id, id);
                ack(data);
                true
            }
            None => false,
        }
    }

    /// Disconnect from the namespace. With `close` the whole connection is
    /// closed too.
    pub fn disconnect(&mut self, close: bool) -> &mut Self {
        if !self.connected {
            return self;
        }

        if close {
            self.client.close();
        } else if let Err(e) = self.packet(Packet::disconnect(self.nsp.name()), false) {
            debug!("Socket {} could not send disconnect: {}", self.id, e);
        }
        self.on_close("server namespace disconnect");
        self
    }

    /// Mark the socket closed and leave every room
    pub fn on_close(&mut self, reason: &str) {
        if !self.connected {
            return;
        }
        info!("Socket {} closed: {}", self.id, reason);
        self.leave_all();
        self.connected = false;
    }

    fn packet(&self, packet: Packet, volatile: bool) -> TransportResult<()> {
        if !self.connected {
            return Err(TransportError::Disconnected(self.id.clone()));
        }
        self.client.conn().outbox().deliver(packet, volatile)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.nsp.adapter().remove_all(&self.id);
    }
}

fn check_reserved(event: &str) -> TransportResult<()> {
    if RESERVED_EVENTS.contains(&event) {
        return Err(TransportError::ReservedEvent(event.to_string()));
    }
    Ok(())
}

/// Emits one event to a set of rooms on behalf of a socket
#[derive(Debug, Clone)]
pub struct BroadcastOperator {
    nsp: Arc<Namespace>,
    opts: BroadcastOptions,
}

impl BroadcastOperator {
    fn new(nsp: Arc<Namespace>, sender: String, flags: Flags) -> Self {
        Self {
            nsp,
            opts: BroadcastOptions {
                rooms: Vec::new(),
                except: vec![sender],
                volatile: flags.volatile,
            },
        }
    }

    /// Add a target room
    pub fn to(mut self, room: impl Into<String>) -> Self {
        let room = room.into();
        if !self.opts.rooms.contains(&room) {
            self.opts.rooms.push(room);
        }
        self
    }

    /// Alias of [`BroadcastOperator::to`]
    pub fn in_(self, room: impl Into<String>) -> Self {
        self.to(room)
    }

    /// Drop the packet for peers that cannot take it right now
    pub fn volatile(mut self) -> Self {
        self.opts.volatile = true;
        self
    }

    /// Target rooms so far
    pub fn rooms(&self) -> &[String] {
        &self.opts.rooms
    }

    /// Emit the event. Returns how many sockets it was queued for.
    pub fn emit(self, event: &str, args: Vec<Value>) -> TransportResult<usize> {
        check_reserved(event)?;
        let packet = Packet::event(self.nsp.name(), event, args, None);
        Ok(self.nsp.adapter().broadcast(&packet, &self.opts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Outbound, Outbox};
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc::Receiver;

    fn namespace(name: &str) -> Arc<Namespace> {
        Arc::new(Namespace::new(name, Arc::new(Server::default())))
    }

    fn socket_in(nsp: &Arc<Namespace>) -> (Socket, Receiver<Outbound>) {
        let (outbox, rx) = Outbox::channel(16);
        let conn = Conn::new(Some("127.0.0.1".to_string()), outbox);
        let request = HandshakeRequest::new("/?token=abc", HeaderMap::new()).unwrap();
        let client = Arc::new(Client::new(conn, request));
        (Socket::new(Arc::clone(nsp), client), rx)
    }

    #[test]
    fn test_socket_joins_own_room() {
        let nsp = namespace("/");
        let (socket, _rx) = socket_in(&nsp);

        assert_eq!(socket.id(), socket.client().id());
        assert_eq!(socket.rooms(), &[socket.id().to_string()]);
        assert_eq!(nsp.adapter().members(socket.id()), vec![socket.id()]);
        assert!(socket.connected());
    }

    #[test]
    fn test_socket_id_in_named_namespace() {
        let nsp = namespace("/chat");
        let (socket, _rx) = socket_in(&nsp);
        assert_eq!(socket.id(), format!("/chat#{}", socket.client().id()));
    }

    #[test]
    fn test_handshake_capture() {
        let nsp = namespace("/");
        let (socket, _rx) = socket_in(&nsp);
        let handshake = socket.handshake();

        assert_eq!(handshake.url, "/?token=abc");
        assert_eq!(handshake.address.as_deref(), Some("127.0.0.1"));
        assert_eq!(handshake.query.get_str("token"), Some("abc"));
        assert!(!handshake.xdomain);
        assert!(!handshake.secure);
        assert!(handshake.issued > 0);
    }

    #[test]
    fn test_join_and_leave() {
        let nsp = namespace("/");
        let (mut socket, _rx) = socket_in(&nsp);

        socket.join("lobby").join("lobby");
        assert_eq!(socket.rooms().len(), 2);
        assert_eq!(nsp.adapter().members("lobby"), vec![socket.id()]);

        socket.leave("lobby");
        assert_eq!(socket.rooms().len(), 1);
        assert!(nsp.adapter().members("lobby").is_empty());
    }

    #[test]
    fn test_emit_sends_event_packet() {
        let nsp = namespace("/");
        let (mut socket, mut rx) = socket_in(&nsp);

        socket.emit("greeting", vec![json!("hi")]).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Packet(Packet::event("/", "greeting", vec![json!("hi")], None))
        );
    }

    #[test]
    fn test_emit_reserved_event_fails() {
        let nsp = namespace("/");
        let (mut socket, _rx) = socket_in(&nsp);

        let result = socket.emit("disconnect", vec![]);
        assert!(matches!(result, Err(TransportError::ReservedEvent(_))));
    }

    #[test]
    fn test_send_and_write_emit_message() {
        let nsp = namespace("/");
        let (mut socket, mut rx) = socket_in(&nsp);

        socket.send(vec![json!(1)]).unwrap();
        socket.write(vec![json!(2)]).unwrap();

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(
            first,
            Outbound::Packet(Packet::event("/", "message", vec![json!(1)], None))
        );
        assert_eq!(
            second,
            Outbound::Packet(Packet::event("/", "message", vec![json!(2)], None))
        );
    }

    #[test]
    fn test_emit_with_ack_runs_callback_once() {
        let nsp = namespace("/");
        let (mut socket, mut rx) = socket_in(&nsp);
        let received = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&received);

        let id = socket
            .emit_with_ack("question", vec![], move |data| {
                *sink.lock().unwrap() = Some(data);
            })
            .unwrap();
        assert_eq!(socket.acks().len(), 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Packet(Packet::event("/", "question", vec![], Some(id)))
        );

        assert!(socket.on_ack(id, vec![json!("answer")]));
        assert!(!socket.on_ack(id, vec![]));
        assert!(socket.acks().is_empty());
        assert_eq!(*received.lock().unwrap(), Some(vec![json!("answer")]));
    }

    #[test]
    fn test_broadcast_flag_routes_through_adapter() {
        let nsp = namespace("/");
        let (mut sender, mut sender_rx) = socket_in(&nsp);
        let (_other, mut other_rx) = socket_in(&nsp);

        sender.set_flags(Flags {
            broadcast: true,
            ..Default::default()
        });
        sender.emit("news", vec![]).unwrap();

        assert!(sender_rx.try_recv().is_err());
        assert!(other_rx.try_recv().is_ok());
        assert_eq!(sender.flags(), Flags::default());
    }

    #[test]
    fn test_ack_rejected_while_broadcasting() {
        let nsp = namespace("/");
        let (mut socket, _rx) = socket_in(&nsp);
        socket.set_flags(Flags {
            broadcast: true,
            ..Default::default()
        });

        let result = socket.emit_with_ack("news", vec![], |_| {});
        assert!(matches!(result, Err(TransportError::AckWhileBroadcasting)));
    }

    #[test]
    fn test_to_room_excludes_sender() {
        let nsp = namespace("/");
        let (mut sender, mut sender_rx) = socket_in(&nsp);
        let (mut member, mut member_rx) = socket_in(&nsp);
        let (_outsider, mut outsider_rx) = socket_in(&nsp);

        sender.join("lobby");
        member.join("lobby");

        let delivered = sender.to("lobby").emit("chat", vec![json!("hey")]).unwrap();
        assert_eq!(delivered, 1);
        assert!(sender_rx.try_recv().is_err());
        assert!(member_rx.try_recv().is_ok());
        assert!(outsider_rx.try_recv().is_err());
    }

    #[test]
    fn test_disconnect_sends_packet_and_leaves_rooms() {
        let nsp = namespace("/");
        let (mut socket, mut rx) = socket_in(&nsp);
        socket.join("lobby");

        socket.disconnect(false);
        assert!(socket.disconnected());
        assert!(socket.rooms().is_empty());
        assert!(nsp.adapter().members("lobby").is_empty());
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Packet(Packet::disconnect("/"))
        );

        let result = socket.emit("late", vec![]);
        assert!(matches!(result, Err(TransportError::Disconnected(_))));
    }

    #[test]
    fn test_disconnect_with_close_closes_connection() {
        let nsp = namespace("/");
        let (mut socket, mut rx) = socket_in(&nsp);

        socket.disconnect(true);
        assert!(socket.disconnected());
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
    }

    #[test]
    fn test_drop_unregisters_socket() {
        let nsp = namespace("/");
        let (socket, _rx) = socket_in(&nsp);
        assert_eq!(nsp.adapter().socket_count(), 1);

        drop(socket);
        assert_eq!(nsp.adapter().socket_count(), 0);
    }
}
