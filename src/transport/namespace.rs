//! Server options and namespaces

use std::sync::Arc;

use super::Adapter;

/// Name of the namespace every server has
pub const ROOT_NAMESPACE: &str = "/";

/// Options shared by every namespace of a server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Server {
    proxy: bool,
    keys: Vec<String>,
}

impl Server {
    pub fn new(proxy: bool, keys: Vec<String>) -> Self {
        Self { proxy, keys }
    }

    /// Whether `X-Forwarded-*` headers are trusted
    pub fn proxy(&self) -> bool {
        self.proxy
    }

    /// Cookie signing keys, newest first
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

/// A group of sockets sharing server options and a room adapter
#[derive(Debug)]
pub struct Namespace {
    name: String,
    server: Arc<Server>,
    adapter: Arc<Adapter>,
}

impl Namespace {
    pub fn new(name: impl Into<String>, server: Arc<Server>) -> Self {
        Self {
            name: name.into(),
            server,
            adapter: Arc::new(Adapter::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn adapter(&self) -> &Arc<Adapter> {
        &self.adapter
    }
}
