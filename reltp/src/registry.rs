//! Connection Registry
//!
//! Maps connection keys to the sockets that own them and keeps, per port, the
//! FIFO of passive sockets waiting for `accept`. One lock guards all of it.

use crate::error::TransportError;
use parking_lot::Mutex;
use reltp_protocol::{ConnectionKey, Port, Socket, SocketState, PORT_LIMIT};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

#[derive(Default)]
struct RegistryInner {
    active: HashMap<ConnectionKey, Arc<Socket>>,
    pending: HashMap<Port, VecDeque<Arc<Socket>>>,
    /// Sockets that reached SYN_SENT while another socket held their key
    contenders: Vec<Arc<Socket>>,
    /// Set by `drain`; no socket is admitted afterwards
    closed: bool,
}

/// Process-wide socket registry of one host
#[derive(Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

fn check_port(port: Port) -> Result<(), TransportError> {
    if port >= PORT_LIMIT {
        return Err(TransportError::InvalidPort(port as i64));
    }
    Ok(())
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the socket for `key`
    pub fn register(&self, key: ConnectionKey, socket: Arc<Socket>) {
        self.inner.lock().active.insert(key, socket);
    }

    /// Insert only if no live socket holds `key`
    ///
    /// A key held by a socket that has already reached CLOSED counts as
    /// vacant and is taken over. Fails with `Shutdown` once drained.
    pub fn register_if_vacant(
        &self,
        key: ConnectionKey,
        socket: Arc<Socket>,
    ) -> Result<bool, TransportError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(TransportError::Shutdown);
        }
        match inner.active.get(&key) {
            Some(existing) if existing.state() != SocketState::Closed => Ok(false),
            _ => {
                inner.active.insert(key, socket);
                Ok(true)
            }
        }
    }

    pub fn lookup(&self, key: &ConnectionKey) -> Option<Arc<Socket>> {
        self.inner.lock().active.get(key).cloned()
    }

    /// Remove `socket` from `key`, leaving any other occupant in place
    pub fn unregister_socket(&self, key: &ConnectionKey, socket: &Arc<Socket>) -> bool {
        let mut inner = self.inner.lock();
        match inner.active.get(key) {
            Some(existing) if Arc::ptr_eq(existing, socket) => {
                inner.active.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Queue a passive socket for a later `accept` on `port`
    pub fn enqueue_passive(&self, port: Port, socket: Arc<Socket>) -> Result<(), TransportError> {
        check_port(port)?;
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(TransportError::Shutdown);
        }
        inner.pending.entry(port).or_default().push_back(socket);
        Ok(())
    }

    /// Take the oldest passive socket queued on `port`
    pub fn dequeue_passive(&self, port: Port) -> Result<Option<Arc<Socket>>, TransportError> {
        check_port(port)?;
        Ok(self
            .inner
            .lock()
            .pending
            .get_mut(&port)
            .and_then(VecDeque::pop_front))
    }

    /// Renew the queued request for `key` on `port`, if there is one
    pub fn renew_pending(&self, port: Port, key: &ConnectionKey, now: Instant) -> bool {
        let inner = self.inner.lock();
        let queued = inner
            .pending
            .get(&port)
            .and_then(|queue| queue.iter().find(|socket| socket.key().as_ref() == Some(key)));
        match queued {
            Some(socket) => {
                socket.renew(now);
                true
            }
            None => false,
        }
    }

    /// Drop every queued request whose connector has given up by `now`
    pub fn expire_pending(&self, now: Instant) -> Vec<Arc<Socket>> {
        let mut expired = Vec::new();
        let mut inner = self.inner.lock();
        for queue in inner.pending.values_mut() {
            queue.retain(|socket| {
                if socket.expire(now) {
                    expired.push(socket.clone());
                    false
                } else {
                    true
                }
            });
        }
        inner.pending.retain(|_, queue| !queue.is_empty());
        expired
    }

    pub fn pending_count(&self, port: Port) -> usize {
        self.inner
            .lock()
            .pending
            .get(&port)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    /// Keep a socket that lost the race for its key visible to the timeout
    /// sweep
    pub fn park_contender(&self, socket: Arc<Socket>) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(TransportError::Shutdown);
        }
        inner.contenders.push(socket);
        Ok(())
    }

    pub fn remove_contender(&self, socket: &Arc<Socket>) {
        self.inner
            .lock()
            .contenders
            .retain(|contender| !Arc::ptr_eq(contender, socket));
    }

    /// Every socket the timeout monitor has to visit
    pub fn sweep_targets(&self) -> Vec<Arc<Socket>> {
        let inner = self.inner.lock();
        inner
            .active
            .values()
            .chain(inner.contenders.iter())
            .cloned()
            .collect()
    }

    /// Empty the registry for good, returning everything it held
    pub fn drain(&self) -> Vec<Arc<Socket>> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let mut sockets: Vec<_> = inner.active.drain().map(|(_, socket)| socket).collect();
        sockets.extend(inner.pending.drain().flat_map(|(_, queue)| queue));
        sockets.append(&mut inner.contenders);
        sockets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reltp_protocol::socket::RetransmitPolicy;
    use reltp_protocol::NetworkAddress;
    use std::time::Duration;

    const LOCAL: NetworkAddress = NetworkAddress::new(1, 10);

    fn passive(remote_port: Port) -> Arc<Socket> {
        Arc::new(Socket::passive(
            LOCAL,
            NetworkAddress::new(2, remote_port),
            RetransmitPolicy::default(),
            Instant::now(),
        ))
    }

    #[test]
    fn test_register_lookup_unregister() {
        let registry = Registry::new();
        let socket = passive(1);
        let key = socket.key().unwrap();

        assert!(registry.lookup(&key).is_none());
        registry.register(key, socket.clone());
        assert!(Arc::ptr_eq(&registry.lookup(&key).unwrap(), &socket));

        assert!(registry.unregister_socket(&key, &socket));
        assert!(registry.lookup(&key).is_none());
    }

    #[test]
    fn test_register_overwrites() {
        let registry = Registry::new();
        let first = passive(1);
        let second = passive(1);
        let key = first.key().unwrap();

        registry.register(key, first);
        registry.register(key, second.clone());
        assert!(Arc::ptr_eq(&registry.lookup(&key).unwrap(), &second));
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_register_if_vacant() {
        let registry = Registry::new();
        let owner = Arc::new(Socket::new(LOCAL, RetransmitPolicy::default()));
        let remote = NetworkAddress::new(2, 20);
        owner.begin_connect(remote, Instant::now()).unwrap();
        let key = owner.key().unwrap();

        assert!(registry.register_if_vacant(key, owner.clone()).unwrap());
        let rival = Arc::new(Socket::new(LOCAL, RetransmitPolicy::default()));
        assert!(!registry.register_if_vacant(key, rival.clone()).unwrap());

        // Once the owner is dead the slot can be reused
        owner.abort();
        assert!(registry.register_if_vacant(key, rival.clone()).unwrap());
        assert!(Arc::ptr_eq(&registry.lookup(&key).unwrap(), &rival));
    }

    #[test]
    fn test_unregister_socket_only_removes_owner() {
        let registry = Registry::new();
        let owner = passive(1);
        let other = passive(1);
        let key = owner.key().unwrap();

        registry.register(key, owner.clone());
        assert!(!registry.unregister_socket(&key, &other));
        assert!(registry.lookup(&key).is_some());
        assert!(registry.unregister_socket(&key, &owner));
        assert!(registry.lookup(&key).is_none());
    }

    #[test]
    fn test_passive_queue_is_fifo() {
        let registry = Registry::new();
        let first = passive(1);
        let second = passive(2);

        registry.enqueue_passive(10, first.clone()).unwrap();
        registry.enqueue_passive(10, second.clone()).unwrap();
        assert_eq!(registry.pending_count(10), 2);
        assert!(registry.renew_pending(10, &first.key().unwrap(), Instant::now()));
        assert!(!registry.renew_pending(11, &first.key().unwrap(), Instant::now()));

        assert!(Arc::ptr_eq(&registry.dequeue_passive(10).unwrap().unwrap(), &first));
        assert!(Arc::ptr_eq(&registry.dequeue_passive(10).unwrap().unwrap(), &second));
        assert!(registry.dequeue_passive(10).unwrap().is_none());
    }

    #[test]
    fn test_invalid_port() {
        let registry = Registry::new();
        assert!(matches!(
            registry.enqueue_passive(PORT_LIMIT, passive(1)),
            Err(TransportError::InvalidPort(128))
        ));
        assert!(registry.dequeue_passive(200).is_err());
    }

    #[test]
    fn test_sweep_targets_include_contenders() {
        let registry = Registry::new();
        let owner = passive(1);
        let contender = passive(1);
        registry.register(owner.key().unwrap(), owner);
        registry.park_contender(contender.clone()).unwrap();

        assert_eq!(registry.sweep_targets().len(), 2);
        registry.remove_contender(&contender);
        assert_eq!(registry.sweep_targets().len(), 1);
    }

    #[test]
    fn test_expire_pending_drops_lapsed_requests() {
        let registry = Registry::new();
        let policy = RetransmitPolicy::default();
        let lapse = policy.interval * policy.max_retry;
        let start = Instant::now();

        let stale = Arc::new(Socket::passive(LOCAL, NetworkAddress::new(2, 1), policy, start));
        let fresh = Arc::new(Socket::passive(
            LOCAL,
            NetworkAddress::new(2, 2),
            policy,
            start + lapse,
        ));
        registry.enqueue_passive(10, stale.clone()).unwrap();
        registry.enqueue_passive(10, fresh.clone()).unwrap();

        assert!(registry.expire_pending(start).is_empty());
        let expired = registry.expire_pending(start + lapse + Duration::from_millis(1));
        assert_eq!(expired.len(), 1);
        assert!(Arc::ptr_eq(&expired[0], &stale));
        assert_eq!(stale.state(), SocketState::Closed);

        assert_eq!(registry.pending_count(10), 1);
        assert!(Arc::ptr_eq(&registry.dequeue_passive(10).unwrap().unwrap(), &fresh));
    }

    #[test]
    fn test_renewed_request_outlives_first_deadline() {
        let registry = Registry::new();
        let policy = RetransmitPolicy::default();
        let lapse = policy.interval * policy.max_retry;
        let start = Instant::now();
        let request = Arc::new(Socket::passive(LOCAL, NetworkAddress::new(2, 1), policy, start));
        let key = request.key().unwrap();
        registry.enqueue_passive(10, request).unwrap();

        assert!(registry.renew_pending(10, &key, start + lapse / 2));
        assert!(registry.expire_pending(start + lapse).is_empty());
        assert_eq!(registry.expire_pending(start + lapse * 2).len(), 1);
        assert!(!registry.renew_pending(10, &key, start + lapse * 2));
    }

    #[test]
    fn test_drain_closes_registry() {
        let registry = Registry::new();
        let owner = Arc::new(Socket::new(LOCAL, RetransmitPolicy::default()));
        owner
            .begin_connect(NetworkAddress::new(2, 20), Instant::now())
            .unwrap();
        let key = owner.key().unwrap();
        registry.register_if_vacant(key, owner).unwrap();
        assert_eq!(registry.drain().len(), 1);

        let late = Arc::new(Socket::new(LOCAL, RetransmitPolicy::default()));
        late.begin_connect(NetworkAddress::new(2, 20), Instant::now())
            .unwrap();
        assert!(matches!(
            registry.register_if_vacant(key, late.clone()),
            Err(TransportError::Shutdown)
        ));
        assert!(matches!(
            registry.park_contender(late),
            Err(TransportError::Shutdown)
        ));
        assert!(matches!(
            registry.enqueue_passive(10, passive(3)),
            Err(TransportError::Shutdown)
        ));
        assert!(registry.sweep_targets().is_empty());
    }
}
