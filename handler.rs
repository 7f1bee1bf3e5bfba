//! Host application message dispatch. Message codes in 0x20-0xFF are never
//! interpreted by the core — they're handed to whichever `Handler` the host
//! registered for that code.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::types::NodeId;

/// Callback surface a host implements to receive session lifecycle events
/// and application messages for the codes it owns.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Message codes (within 0x20-0xFF) this handler answers for.
    fn codes(&self) -> &[u8];

    async fn on_connect(&self, peer: NodeId) {
        let _ = peer;
    }

    async fn on_disconnect(&self, peer: NodeId) {
        let _ = peer;
    }

    async fn on_message(&self, peer: NodeId, code: u8, payload: Bytes);
}

pub const HOST_CODE_RANGE_START: u8 = 0x20;

/// Shared via `Arc<HandlerRegistry>` across the discovery, channel, and
/// session tasks, so registration (the only mutating operation) goes
/// through an `RwLock` rather than requiring `&mut` access to the whole
/// registry once it has been handed to the rest of the node.
#[derive(Default)]
pub struct HandlerRegistry {
    by_code: RwLock<HashMap<u8, Arc<dyn Handler>>>,
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerRegistryError {
    #[error("code {0:#04x} is outside the host application range (0x20-0xff)")]
    OutOfRange(u8),
    #[error("a handler is already registered for code {0:#04x}")]
    AlreadyRegistered(u8),
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry {
            by_code: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `handler` for every code it claims. Each code may have
    /// exactly one handler; a collision leaves the registry untouched.
    pub async fn register(&self, handler: Arc<dyn Handler>) -> Result<(), HandlerRegistryError> {
        let mut by_code = self.by_code.write().await;
        for &code in handler.codes() {
            if code < HOST_CODE_RANGE_START {
                return Err(HandlerRegistryError::OutOfRange(code));
            }
            if by_code.contains_key(&code) {
                return Err(HandlerRegistryError::AlreadyRegistered(code));
            }
        }
        for &code in handler.codes() {
            by_code.insert(code, handler.clone());
        }
        Ok(())
    }

    pub async fn get(&self, code: u8) -> Option<Arc<dyn Handler>> {
        self.by_code.read().await.get(&code).cloned()
    }

    pub async fn dispatch(&self, peer: NodeId, code: u8, payload: Bytes) -> bool {
        let handler = self.by_code.read().await.get(&code).cloned();
        if let Some(handler) = handler {
            handler.on_message(peer, code, payload).await;
            true
        } else {
            false
        }
    }

    pub async fn broadcast_connect(&self, peer: NodeId) {
        let mut seen = std::collections::HashSet::new();
        let by_code = self.by_code.read().await;
        for handler in by_code.values() {
            if seen.insert(Arc::as_ptr(handler) as *const ()) {
                handler.on_connect(peer).await;
            }
        }
    }

    pub async fn broadcast_disconnect(&self, peer: NodeId) {
        let mut seen = std::collections::HashSet::new();
        let by_code = self.by_code.read().await;
        for handler in by_code.values() {
            if seen.insert(Arc::as_ptr(handler) as *const ()) {
                handler.on_disconnect(peer).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        codes: Vec<u8>,
        hits: AtomicUsize,
    }

    #[async_trait]
    impl Handler for CountingHandler {
        fn codes(&self) -> &[u8] {
            &self.codes
        }

        async fn on_message(&self, _peer: NodeId, _code: u8, _payload: Bytes) {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[tokio::test]
    async fn rejects_duplicate_code_registration() {
        let registry = HandlerRegistry::new();
        let a = Arc::new(CountingHandler {
            codes: vec![0x21],
            hits: AtomicUsize::new(0),
        });
        let b = Arc::new(CountingHandler {
            codes: vec![0x21],
            hits: AtomicUsize::new(0),
        });
        registry.register(a).await.unwrap();
        assert!(matches!(
            registry.register(b).await,
            Err(HandlerRegistryError::AlreadyRegistered(0x21))
        ));
    }

    #[tokio::test]
    async fn rejects_reserved_code_range() {
        let registry = HandlerRegistry::new();
        let handler = Arc::new(CountingHandler {
            codes: vec![0x10],
            hits: AtomicUsize::new(0),
        });
        assert!(matches!(
            registry.register(handler).await,
            Err(HandlerRegistryError::OutOfRange(0x10))
        ));
    }

    #[tokio::test]
    async fn dispatch_routes_to_registered_handler() {
        let registry = HandlerRegistry::new();
        let handler = Arc::new(CountingHandler {
            codes: vec![0x30],
            hits: AtomicUsize::new(0),
        });
        registry.register(handler.clone()).await.unwrap();
        let dispatched = registry
            .dispatch(NodeId::zero(), 0x30, Bytes::from_static(b"hi"))
            .await;
        assert!(dispatched);
        assert_eq!(handler.hits.load(Ordering::Relaxed), 1);
        assert!(!registry.dispatch(NodeId::zero(), 0x99, Bytes::new()).await);
    }
}
