//! WebSocket server implementation
//!
//! Accepts WebSocket connections, builds one connection context per client and
//! routes its packets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HsRequest, Response as HsResponse,
};
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::protocol::Packet;
use super::Router;
use crate::context::{ConnectionContext, Query};
use crate::transport::{
    Client, Conn, HandshakeRequest, Namespace, Outbound, Outbox, Server, TransportError,
    OUTBOX_CAPACITY, ROOT_NAMESPACE,
};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// How long shutdown waits for open connections before aborting them
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Trust `X-Forwarded-*` headers
    pub proxy: bool,
    /// Cookie signing keys, newest first
    pub keys: Vec<String>,
    /// Namespaces clients may connect to
    pub namespaces: Vec<String>,
}

impl ServerConfig {
    /// Create a new server configuration serving the root namespace
    pub fn new(bind: String, port: u16) -> Self {
        Self {
            bind,
            port,
            proxy: false,
            keys: Vec::new(),
            namespaces: vec![ROOT_NAMESPACE.to_string()],
        }
    }

    /// Trust proxy headers
    pub fn with_proxy(mut self, proxy: bool) -> Self {
        self.proxy = proxy;
        self
    }

    /// Set the cookie signing keys
    pub fn with_keys(mut self, keys: Vec<String>) -> Self {
        self.keys = keys;
        self
    }

    /// Set the served namespaces; the root namespace is always kept
    pub fn with_namespaces(mut self, namespaces: Vec<String>) -> Self {
        let mut served = vec![ROOT_NAMESPACE.to_string()];
        for name in namespaces {
            if !served.contains(&name) {
                served.push(name);
            }
        }
        self.namespaces = served;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// WebSocket server for realtime clients
pub struct WebSocketServer {
    config: ServerConfig,
    namespaces: Arc<HashMap<String, Arc<Namespace>>>,
    router: Arc<Router>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server with the built-in routes
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let server = Arc::new(Server::new(config.proxy, config.keys.clone()));
        let namespaces = config
            .namespaces
            .iter()
            .map(|name| {
                let nsp = Namespace::new(name.clone(), Arc::clone(&server));
                (name.clone(), Arc::new(nsp))
            })
            .collect();

        Self {
            config,
            namespaces: Arc::new(namespaces),
            router: Arc::new(Router::with_defaults()),
            shutdown_tx,
        }
    }

    /// Replace the event router
    pub fn with_router(mut self, router: Router) -> Self {
        self.router = Arc::new(router);
        self
    }

    /// Look up a served namespace
    pub fn namespace(&self, name: &str) -> Option<&Arc<Namespace>> {
        self.namespaces.get(name)
    }

    /// Get a shutdown signal receiver (for external components to listen for shutdown)
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("WebSocket server listening on ws://{}", addr);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    ///
    /// Each connection is handled in its own task. Returns once a shutdown
    /// signal is received.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let namespaces = Arc::clone(&self.namespaces);
                            let router = Arc::clone(&self.router);
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            connections.spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, namespaces, router, shutdown_rx).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Reap finished connection tasks
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        if !connections.is_empty() {
            info!("Waiting for {} active connections to close...", connections.len());
            let drain = async { while connections.join_next().await.is_some() {} };
            if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
                warn!(
                    "Aborting {} connections still open after {:?}",
                    connections.len(),
                    SHUTDOWN_GRACE
                );
                connections.shutdown().await;
            }
        }

        Ok(())
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    namespaces: Arc<HashMap<String, Arc<Namespace>>>,
    router: Arc<Router>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    info!("New connection from {}", peer_addr);

    // Upgrade to WebSocket, keeping the upgrade request
    let captured: Arc<Mutex<Option<HandshakeRequest>>> = Arc::new(Mutex::new(None));
    let captured_cb = Arc::clone(&captured);
    let callback =
        move |req: &HsRequest, response: HsResponse| -> Result<HsResponse, ErrorResponse> {
            *captured_cb.lock() = Some(HandshakeRequest::from_http(req));
            Ok(response)
        };

    let ws_stream = accept_hdr_async(stream, callback).await?;
    let request = captured
        .lock()
        .take()
        .ok_or_else(|| anyhow!("handshake request was not captured"))?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let nsp_name = Query::parse(request.uri().query().unwrap_or(""))
        .get_str("nsp")
        .unwrap_or(ROOT_NAMESPACE)
        .to_string();
    let Some(nsp) = namespaces.get(&nsp_name).cloned() else {
        warn!("Rejecting {}: unknown namespace {}", peer_addr, nsp_name);
        let rejection = Packet::error(nsp_name.clone(), format!("Invalid namespace {}", nsp_name));
        ws_sender.send(Message::Text(rejection.to_json()?)).await?;
        let _ = ws_sender.send(Message::Close(None)).await;
        return Ok(());
    };

    let (outbox, mut outbound_rx) = Outbox::channel(OUTBOX_CAPACITY);
    let conn = Conn::new(Some(peer_addr.ip().to_string()), outbox);
    let mut ctx = ConnectionContext::new(nsp, Arc::new(Client::new(conn, request)));

    // Tell the client its socket id
    let connect = Packet::connect(nsp_name.as_str(), Some(ctx.id().to_string()));
    ws_sender.send(Message::Text(connect.to_json()?)).await?;
    info!("Socket {} connected to {} from {}", ctx.id(), nsp_name, peer_addr);

    // Packet handling loop
    loop {
        tokio::select! {
            // Receive packets from client
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received packet from {}: {}", peer_addr, text);
                        handle_text(&text, &mut ctx, &router)?;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!("Received binary message from {} ({} bytes), ignoring", peer_addr, data.len());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pong messages
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {} requested close", peer_addr);
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {
                        // Raw frame, ignore
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", peer_addr, e);
                        break;
                    }
                    None => {
                        info!("Connection closed by {}", peer_addr);
                        break;
                    }
                }
            }
            // Write packets queued by sockets and broadcasts
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(Outbound::Packet(packet)) => {
                        ws_sender.send(Message::Text(packet.to_json()?)).await?;
                    }
                    Some(Outbound::Close) | None => {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            // Handle shutdown signal
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, closing connection to {}", peer_addr);
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
        }

        if ctx.disconnected() {
            flush_outbound(&mut ws_sender, &mut outbound_rx).await?;
            let _ = ws_sender.send(Message::Close(None)).await;
            break;
        }
    }

    ctx.socket_mut().on_close("transport close");
    info!("Connection from {} closed", peer_addr);
    Ok(())
}

/// Send whatever packets are still queued, stopping at a close request
async fn flush_outbound(
    ws_sender: &mut WsSink,
    outbound_rx: &mut mpsc::Receiver<Outbound>,
) -> anyhow::Result<()> {
    while let Ok(Outbound::Packet(packet)) = outbound_rx.try_recv() {
        ws_sender.send(Message::Text(packet.to_json()?)).await?;
    }
    Ok(())
}

/// Handle one text frame from the client
fn handle_text(
    text: &str,
    ctx: &mut ConnectionContext,
    router: &Router,
) -> Result<(), TransportError> {
    let packet = match Packet::from_json(text) {
        Ok(packet) => packet,
        Err(e) => {
            warn!("Invalid packet from socket {}: {}", ctx.id(), e);
            return ctx.socket_mut().error(e.to_string());
        }
    };

    if packet.nsp() != ctx.socket().nsp().name() {
        debug!(
            "Ignoring packet for namespace {} on socket {}",
            packet.nsp(),
            ctx.id()
        );
        return Ok(());
    }

    match packet {
        Packet::Event { data, id, .. } => {
            let mut args = data.into_iter();
            let Some(Value::String(event)) = args.next() else {
                return Ok(());
            };

            let result = router.dispatch(ctx, &event, args.collect());
            if ctx.disconnected() {
                return Ok(());
            }
            match (result, id) {
                (Ok(reply), Some(id)) => ctx.socket_mut().ack(id, reply.unwrap_or_default())?,
                (Ok(_), None) => {}
                (Err(e), _) => {
                    warn!("Handler for {} failed on socket {}: {}", event, ctx.id(), e);
                    ctx.socket_mut().error(e.to_string())?;
                }
            }
        }
        Packet::Ack { id, data, .. } => {
            if !ctx.socket_mut().on_ack(id, data) {
                debug!("Socket {} got ack {} with nothing waiting", ctx.id(), id);
            }
        }
        Packet::Disconnect { .. } => {
            ctx.socket_mut().on_close("client namespace disconnect");
        }
        Packet::Connect { .. } | Packet::Error { .. } => {
            debug!("Ignoring client-sent packet on socket {}: {}", ctx.id(), text);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_tungstenite::{connect_async, MaybeTlsStream};

    type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

    #[test]
    fn test_server_config() {
        let config = ServerConfig::new("127.0.0.1".to_string(), 9000);
        assert_eq!(config.socket_addr(), "127.0.0.1:9000");
        assert_eq!(config.namespaces, vec!["/"]);
        assert!(!config.proxy);
    }

    #[test]
    fn test_server_config_namespaces_keep_root() {
        let config = ServerConfig::new("0.0.0.0".to_string(), 8080)
            .with_namespaces(vec!["/chat".to_string(), "/chat".to_string()]);
        assert_eq!(config.namespaces, vec!["/", "/chat"]);
    }

    #[test]
    fn test_server_builds_namespaces() {
        let config = ServerConfig::new("127.0.0.1".to_string(), 0)
            .with_proxy(true)
            .with_keys(vec!["secret".to_string()])
            .with_namespaces(vec!["/chat".to_string()]);
        let server = WebSocketServer::new(config);

        let chat = server.namespace("/chat").unwrap();
        assert!(chat.server().proxy());
        assert_eq!(chat.server().keys(), &["secret".to_string()]);
        assert!(server.namespace("/").is_some());
        assert!(server.namespace("/missing").is_none());
    }

    async fn start() -> (Arc<WebSocketServer>, SocketAddr) {
        let config = ServerConfig::new("127.0.0.1".to_string(), 0)
            .with_namespaces(vec!["/chat".to_string()]);
        let server = Arc::new(WebSocketServer::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = Arc::clone(&server);
        tokio::spawn(async move { handle.serve(listener).await });
        (server, addr)
    }

    async fn next_packet(ws: &mut ClientStream) -> Packet {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return Packet::from_json(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("Expected a text frame, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_connect_and_whoami() {
        let (server, addr) = start().await;
        let (mut ws, _) = connect_async(format!("ws://{}/live?room=lobby", addr))
            .await
            .unwrap();

        let sid = match next_packet(&mut ws).await {
            Packet::Connect { nsp, sid } => {
                assert_eq!(nsp, "/");
                sid.unwrap()
            }
            other => panic!("Expected Connect packet, got {:?}", other),
        };

        let whoami = Packet::event("/", "whoami", vec![], Some(1));
        ws.send(Message::Text(whoami.to_json().unwrap())).await.unwrap();

        match next_packet(&mut ws).await {
            Packet::Ack { id, data, .. } => {
                assert_eq!(id, 1);
                assert_eq!(data[0]["id"], json!(sid));
                assert_eq!(data[0]["path"], json!("/live"));
                assert_eq!(data[0]["query"]["room"], json!("lobby"));
                assert_eq!(data[0]["ip"], json!("127.0.0.1"));
                assert_eq!(data[0]["protocol"], json!("http"));
            }
            other => panic!("Expected Ack packet, got {:?}", other),
        }

        server.shutdown();
    }

    #[tokio::test]
    async fn test_chat_between_clients() {
        let (server, addr) = start().await;
        let url = format!("ws://{}/?nsp=%2Fchat", addr);
        let (mut alice, _) = connect_async(url.as_str()).await.unwrap();
        let (mut bob, _) = connect_async(url.as_str()).await.unwrap();
        assert!(matches!(next_packet(&mut alice).await, Packet::Connect { .. }));
        assert!(matches!(next_packet(&mut bob).await, Packet::Connect { .. }));

        for (ws, id) in [(&mut alice, 1), (&mut bob, 2)] {
            let join = Packet::event("/chat", "join", vec![json!("lobby")], Some(id));
            ws.send(Message::Text(join.to_json().unwrap())).await.unwrap();
            assert!(matches!(next_packet(ws).await, Packet::Ack { .. }));
        }

        let chat = Packet::event("/chat", "chat", vec![json!("lobby"), json!("hello")], None);
        alice.send(Message::Text(chat.to_json().unwrap())).await.unwrap();

        match next_packet(&mut bob).await {
            Packet::Event { nsp, data, .. } => {
                assert_eq!(nsp, "/chat");
                assert_eq!(data, vec![json!("chat"), json!("hello")]);
            }
            other => panic!("Expected Event packet, got {:?}", other),
        }

        server.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_connections() {
        let server = Arc::new(WebSocketServer::new(ServerConfig::new(
            "127.0.0.1".to_string(),
            0,
        )));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = Arc::clone(&server);
        let serving = tokio::spawn(async move { handle.serve(listener).await });

        let (mut ws, _) = connect_async(format!("ws://{}/", addr)).await.unwrap();
        assert!(matches!(next_packet(&mut ws).await, Packet::Connect { .. }));
        assert_eq!(server.namespace("/").unwrap().adapter().socket_count(), 1);

        server.shutdown();
        serving.await.unwrap().unwrap();

        // The connection task has finished, so its socket is gone
        assert_eq!(server.namespace("/").unwrap().adapter().socket_count(), 0);
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_namespace_is_rejected() {
        let (server, addr) = start().await;
        let (mut ws, _) = connect_async(format!("ws://{}/?nsp=%2Fnope", addr))
            .await
            .unwrap();

        match next_packet(&mut ws).await {
            Packet::Error { message, .. } => assert!(message.contains("Invalid namespace")),
            other => panic!("Expected Error packet, got {:?}", other),
        }

        server.shutdown();
    }

    #[tokio::test]
    async fn test_invalid_packet_reports_error() {
        let (server, addr) = start().await;
        let (mut ws, _) = connect_async(format!("ws://{}/", addr)).await.unwrap();
        assert!(matches!(next_packet(&mut ws).await, Packet::Connect { .. }));

        ws.send(Message::Text(r#"{"type": "event", "data": []}"#.to_string()))
            .await
            .unwrap();

        match next_packet(&mut ws).await {
            Packet::Error { message, .. } => assert!(message.contains("cannot be empty")),
            other => panic!("Expected Error packet, got {:?}", other),
        }

        server.shutdown();
    }
}
