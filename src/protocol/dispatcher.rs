use crate::core::emsg::MsgType;
use crate::core::envelope::Envelope;
use crate::core::registry::Body;
use crate::error::{constants, ProtocolError, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

type HandlerFn = dyn Fn(&Envelope, &Body) -> Result<()> + Send + Sync + 'static;

/// Message dispatcher routing decoded messages to handlers by message type.
///
/// The client calls [`Dispatcher::dispatch`] from its single read loop, so
/// handlers see messages in arrival order and each message at most once.
/// Cloning shares the handler table.
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Arc<RwLock<HashMap<MsgType, Box<HandlerFn>>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.handlers.read().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("Dispatcher").field("handlers", &count).finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Install `handler` for `msg_type`, replacing any previous one.
    pub fn register<F>(&self, msg_type: MsgType, handler: F) -> Result<()>
    where
        F: Fn(&Envelope, &Body) -> Result<()> + Send + Sync + 'static,
    {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string()))?;

        handlers.insert(msg_type, Box::new(handler));
        Ok(())
    }

    pub fn unregister(&self, msg_type: MsgType) -> Result<bool> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string()))?;

        Ok(handlers.remove(&msg_type).is_some())
    }

    pub fn has_handler(&self, msg_type: MsgType) -> bool {
        self.handlers
            .read()
            .map(|h| h.contains_key(&msg_type))
            .unwrap_or(false)
    }

    /// Run the handler registered for the envelope's type.
    ///
    /// Returns `Ok(false)` when no handler is registered.
    pub fn dispatch(&self, envelope: &Envelope, body: &Body) -> Result<bool> {
        let handlers = self
            .handlers
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_READ_LOCK.to_string()))?;

        match handlers.get(&envelope.msg_type()) {
            Some(handler) => handler(envelope, body).map(|()| true),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::proto::HeartBeat;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn heartbeat() -> Envelope {
        Envelope::proto(MsgType::CLIENT_HEARTBEAT, &HeartBeat::default())
    }

    #[test]
    fn test_dispatch_routes_by_type() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        dispatcher
            .register(MsgType::CLIENT_HEARTBEAT, move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let body = Body::Raw(Bytes::new());
        assert!(dispatcher.dispatch(&heartbeat(), &body).unwrap());
        let other = Envelope::proto(MsgType::CLIENT_LOGGED_OFF, &HeartBeat::default());
        assert!(!dispatcher.dispatch(&other, &body).unwrap());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handlers_see_arrival_order() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        dispatcher
            .register(MsgType::CLIENT_HEARTBEAT, move |env, _| {
                log.lock().unwrap().push(env.body().len());
                Ok(())
            })
            .unwrap();

        for len in [1usize, 2, 3] {
            let env = Envelope::new(heartbeat().header().clone(), vec![0u8; len]);
            dispatcher.dispatch(&env, &Body::Raw(Bytes::new())).unwrap();
        }
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_handler_error_is_returned() {
        let dispatcher = Dispatcher::new();
        dispatcher
            .register(MsgType::CLIENT_HEARTBEAT, |_, _| {
                Err(ProtocolError::Custom("boom".into()))
            })
            .unwrap();
        let result = dispatcher.dispatch(&heartbeat(), &Body::Raw(Bytes::new()));
        assert!(matches!(result, Err(ProtocolError::Custom(_))));
        assert!(dispatcher.unregister(MsgType::CLIENT_HEARTBEAT).unwrap());
        assert!(!dispatcher.has_handler(MsgType::CLIENT_HEARTBEAT));
    }
}
