//! Event routing
//!
//! Maps event names to handlers. A handler gets the connection context and
//! the event arguments; whatever it returns is sent back as the
//! acknowledgement when the client asked for one.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use serde_json::{json, Value};
use tracing::debug;

use crate::context::ConnectionContext;

/// What a handler hands back: acknowledgement data, if any
pub type HandlerResult = anyhow::Result<Option<Vec<Value>>>;

/// Handles one event for one connection
pub trait EventHandler: Send + Sync {
    fn handle(&self, ctx: &mut ConnectionContext, args: Vec<Value>) -> HandlerResult;
}

impl<F> EventHandler for F
where
    F: Fn(&mut ConnectionContext, Vec<Value>) -> HandlerResult + Send + Sync,
{
    fn handle(&self, ctx: &mut ConnectionContext, args: Vec<Value>) -> HandlerResult {
        self(ctx, args)
    }
}

/// Event name to handler table
#[derive(Clone, Default)]
pub struct Router {
    routes: HashMap<String, Arc<dyn EventHandler>>,
}

impl Router {
    /// Create an empty router
    pub fn new() -> Self {
        Self::default()
    }

    /// Router with the built-in `join`, `leave`, `chat` and `whoami` events
    pub fn with_defaults() -> Self {
        Self::new()
            .route("join", handle_join)
            .route("leave", handle_leave)
            .route("chat", handle_chat)
            .route("whoami", handle_whoami)
    }

    /// Register a handler, replacing any previous one for `event`
    pub fn route(mut self, event: impl Into<String>, handler: impl EventHandler + 'static) -> Self {
        self.routes.insert(event.into(), Arc::new(handler));
        self
    }

    pub fn contains(&self, event: &str) -> bool {
        self.routes.contains_key(event)
    }

    /// Run the handler for `event`. Unknown events are ignored.
    pub fn dispatch(&self, ctx: &mut ConnectionContext, event: &str, args: Vec<Value>) -> HandlerResult {
        match self.routes.get(event) {
            Some(handler) => {
                debug!("Dispatching {} for socket {}", event, ctx.id());
                handler.handle(ctx, args)
            }
            None => {
                debug!("No handler for event {} from socket {}", event, ctx.id());
                Ok(None)
            }
        }
    }
}

fn room_arg(args: &[Value]) -> anyhow::Result<String> {
    args.first()
        .and_then(Value::as_str)
        .filter(|room| !room.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| anyhow!("expected a room name as the first argument"))
}

fn handle_join(ctx: &mut ConnectionContext, args: Vec<Value>) -> HandlerResult {
    let room = room_arg(&args)?;
    ctx.join(room);
    Ok(Some(vec![json!(ctx.rooms())]))
}

fn handle_leave(ctx: &mut ConnectionContext, args: Vec<Value>) -> HandlerResult {
    let room = room_arg(&args)?;
    ctx.leave(&room);
    Ok(Some(vec![json!(ctx.rooms())]))
}

/// Relay the remaining arguments to everyone else in the room
fn handle_chat(ctx: &mut ConnectionContext, args: Vec<Value>) -> HandlerResult {
    let room = room_arg(&args)?;
    let payload = args.into_iter().skip(1).collect();
    let delivered = ctx.to(room).emit("chat", payload)?;
    Ok(Some(vec![json!(delivered)]))
}

fn handle_whoami(ctx: &mut ConnectionContext, _args: Vec<Value>) -> HandlerResult {
    let query = ctx.query();
    Ok(Some(vec![json!({
        "id": ctx.id(),
        "ip": ctx.ip(),
        "ips": ctx.ips(),
        "host": ctx.host(),
        "hostname": ctx.hostname(),
        "protocol": ctx.protocol(),
        "secure": ctx.secure(),
        "path": ctx.path(),
        "query": &*query,
        "rooms": ctx.rooms(),
    })]))
}
