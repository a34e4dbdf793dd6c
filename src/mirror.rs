//! In-memory GATT mirror shared by every transport.
//!
//! The mirror is the authoritative service/characteristic registry: it
//! owns characteristic values, write handlers, and subscriber sets. TCP
//! sessions and the BLE peripheral all operate on the same tree, so a
//! value written over one transport is immediately visible on the other.
//!
//! Locking: all operations complete synchronously under one mutex. The
//! lock is held only for the value update and a snapshot of the
//! subscriber sinks; actual fanout I/O happens on the snapshot after the
//! lock is released. Write handlers likewise run outside the lock, so a
//! handler may call back into the mirror (the Ride and FTMS handlers do).

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::tnp::{PROP_INDICATE, PROP_NOTIFY, PROP_WRITE};

/// Largest characteristic value the mirror will store.
pub const MAX_VALUE_LEN: usize = 512;

/// Depth of each per-session notification queue. A session that falls
/// this far behind starts losing notifications, not blocking others.
const SINK_DEPTH: usize = 32;

/// Identifies one subscriber across all transports.
pub type SessionId = u64;

/// Handler invoked after a write is committed to the value store.
pub type WriteHandler = std::sync::Arc<dyn Fn(&[u8]) + Send + Sync>;

/// One notification as fanned out to subscriber sinks.
#[derive(Debug, Clone)]
pub struct Notification {
    pub uuid: Uuid,
    pub value: Vec<u8>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MirrorError {
    #[error("service not found")]
    ServiceNotFound,
    #[error("characteristic not found")]
    CharacteristicNotFound,
    #[error("operation not supported by characteristic properties")]
    NotSupported,
    #[error("value exceeds {MAX_VALUE_LEN} bytes")]
    ValueTooLong,
    #[error("UUID already registered")]
    DuplicateUuid,
}

/// Startup description of one characteristic.
pub struct CharacteristicSpec {
    pub uuid: Uuid,
    pub properties: u8,
    pub value: Vec<u8>,
    pub on_write: Option<WriteHandler>,
}

impl CharacteristicSpec {
    pub fn new(uuid: Uuid, properties: u8) -> Self {
        CharacteristicSpec { uuid, properties, value: Vec::new(), on_write: None }
    }

    pub fn with_value(mut self, value: Vec<u8>) -> Self {
        self.value = value;
        self
    }

    pub fn with_handler(mut self, handler: WriteHandler) -> Self {
        self.on_write = Some(handler);
        self
    }
}

/// Snapshot of one service for transports that build their own tree.
#[derive(Debug, Clone)]
pub struct ServiceSnapshot {
    pub uuid: Uuid,
    pub characteristics: Vec<(Uuid, u8)>,
}

struct CharState {
    properties: u8,
    value: Vec<u8>,
    on_write: Option<WriteHandler>,
    subscribers: BTreeSet<SessionId>,
}

struct ServiceState {
    uuid: Uuid,
    characteristics: Vec<Uuid>,
}

#[derive(Default)]
struct Inner {
    services: Vec<ServiceState>,
    characteristics: HashMap<Uuid, CharState>,
    sinks: HashMap<SessionId, mpsc::Sender<Notification>>,
}

#[derive(Default)]
pub struct GattMirror {
    inner: Mutex<Inner>,
    next_session: AtomicU64,
}

impl GattMirror {
    pub fn new() -> Self {
        GattMirror::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh session id for any transport endpoint.
    pub fn allocate_session(&self) -> SessionId {
        self.next_session.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a service and its characteristics. Startup only; the
    /// tree never shrinks afterwards.
    pub fn register_service(
        &self,
        uuid: Uuid,
        characteristics: Vec<CharacteristicSpec>,
    ) -> Result<(), MirrorError> {
        let mut inner = self.lock();
        if inner.services.iter().any(|s| s.uuid == uuid) {
            return Err(MirrorError::DuplicateUuid);
        }
        if characteristics.iter().any(|c| inner.characteristics.contains_key(&c.uuid)) {
            return Err(MirrorError::DuplicateUuid);
        }

        let mut order = Vec::with_capacity(characteristics.len());
        for spec in characteristics {
            if order.contains(&spec.uuid) {
                return Err(MirrorError::DuplicateUuid);
            }
            order.push(spec.uuid);
            inner.characteristics.insert(
                spec.uuid,
                CharState {
                    properties: spec.properties,
                    value: spec.value,
                    on_write: spec.on_write,
                    subscribers: BTreeSet::new(),
                },
            );
        }
        inner.services.push(ServiceState { uuid, characteristics: order });
        Ok(())
    }

    /// Registered service UUIDs, in registration order. This is the list
    /// a DISCOVER_SERVICES request is answered with.
    pub fn service_uuids(&self) -> Vec<Uuid> {
        self.lock().services.iter().map(|s| s.uuid).collect()
    }

    /// (characteristic UUID, property mask) pairs of one service, in
    /// registration order.
    pub fn characteristics_of(&self, service: &Uuid) -> Result<Vec<(Uuid, u8)>, MirrorError> {
        let inner = self.lock();
        let svc = inner
            .services
            .iter()
            .find(|s| s.uuid == *service)
            .ok_or(MirrorError::ServiceNotFound)?;
        Ok(svc
            .characteristics
            .iter()
            .filter_map(|c| inner.characteristics.get(c).map(|st| (*c, st.properties)))
            .collect())
    }

    /// Full tree snapshot for transports that instantiate their own
    /// attribute database (the BLE peripheral).
    pub fn services(&self) -> Vec<ServiceSnapshot> {
        let inner = self.lock();
        inner
            .services
            .iter()
            .map(|svc| ServiceSnapshot {
                uuid: svc.uuid,
                characteristics: svc
                    .characteristics
                    .iter()
                    .filter_map(|c| inner.characteristics.get(c).map(|st| (*c, st.properties)))
                    .collect(),
            })
            .collect()
    }

    pub fn properties(&self, uuid: &Uuid) -> Result<u8, MirrorError> {
        self.lock()
            .characteristics
            .get(uuid)
            .map(|c| c.properties)
            .ok_or(MirrorError::CharacteristicNotFound)
    }

    /// Current value of a characteristic.
    pub fn value(&self, uuid: &Uuid) -> Result<Vec<u8>, MirrorError> {
        self.lock()
            .characteristics
            .get(uuid)
            .map(|c| c.value.clone())
            .ok_or(MirrorError::CharacteristicNotFound)
    }

    /// Replace a characteristic value on behalf of a peer. Requires the
    /// WRITE property. The write handler, if any, runs after the value
    /// is committed and outside the registry lock. Zero-length writes
    /// are valid.
    pub fn write(&self, uuid: &Uuid, value: &[u8]) -> Result<(), MirrorError> {
        if value.len() > MAX_VALUE_LEN {
            return Err(MirrorError::ValueTooLong);
        }
        let handler = {
            let mut inner = self.lock();
            let chr = inner
                .characteristics
                .get_mut(uuid)
                .ok_or(MirrorError::CharacteristicNotFound)?;
            if chr.properties & PROP_WRITE == 0 {
                return Err(MirrorError::NotSupported);
            }
            chr.value = value.to_vec();
            chr.on_write.clone()
        };
        if let Some(handler) = handler {
            handler(value);
        }
        Ok(())
    }

    /// Add a session to a characteristic's subscriber set. Requires
    /// NOTIFY or INDICATE.
    pub fn subscribe(&self, session: SessionId, uuid: &Uuid) -> Result<(), MirrorError> {
        let mut inner = self.lock();
        let chr = inner
            .characteristics
            .get_mut(uuid)
            .ok_or(MirrorError::CharacteristicNotFound)?;
        if chr.properties & (PROP_NOTIFY | PROP_INDICATE) == 0 {
            return Err(MirrorError::NotSupported);
        }
        chr.subscribers.insert(session);
        Ok(())
    }

    pub fn unsubscribe(&self, session: SessionId, uuid: &Uuid) {
        if let Some(chr) = self.lock().characteristics.get_mut(uuid) {
            chr.subscribers.remove(&session);
        }
    }

    /// Register the notification sink a session drains. One sink per
    /// session; replaced on reconnect.
    pub fn add_sink(&self, session: SessionId, sink: mpsc::Sender<Notification>) {
        self.lock().sinks.insert(session, sink);
    }

    /// Remove a session from every subscriber set and drop its sink.
    /// Must run on every session exit path, normal or not.
    pub fn drop_session(&self, session: SessionId) {
        let mut inner = self.lock();
        inner.sinks.remove(&session);
        for chr in inner.characteristics.values_mut() {
            chr.subscribers.remove(&session);
        }
        debug!("dropped session {}", session);
    }

    pub fn subscriber_count(&self, uuid: &Uuid) -> usize {
        self.lock()
            .characteristics
            .get(uuid)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }

    /// Replace a characteristic value and fan the new value out to every
    /// current subscriber. Delivery is best-effort per sink: a full queue
    /// drops the notification for that session only.
    pub fn notify(&self, uuid: &Uuid, value: &[u8]) {
        let targets: Vec<(SessionId, mpsc::Sender<Notification>)> = {
            let mut inner = self.lock();
            let Some(chr) = inner.characteristics.get_mut(uuid) else {
                warn!("notify on unknown characteristic {}", uuid);
                return;
            };
            chr.value = value.to_vec();
            let subscribers: Vec<SessionId> = chr.subscribers.iter().copied().collect();
            subscribers
                .into_iter()
                .filter_map(|s| inner.sinks.get(&s).map(|sink| (s, sink.clone())))
                .collect()
        };

        for (session, sink) in targets {
            let notification = Notification { uuid: *uuid, value: value.to_vec() };
            match sink.try_send(notification) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("session {} notification queue full, dropping {}", session, uuid);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("session {} sink closed", session);
                }
            }
        }
    }

    /// Create a notification channel sized for one session.
    pub fn notification_channel() -> (mpsc::Sender<Notification>, mpsc::Receiver<Notification>) {
        mpsc::channel(SINK_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tnp::PROP_READ;
    use crate::uuids;
    use std::sync::Arc;

    fn mirror_with_ride() -> GattMirror {
        let mirror = GattMirror::new();
        mirror
            .register_service(
                uuids::ZWIFT_RIDE_SERVICE_UUID,
                vec![
                    CharacteristicSpec::new(uuids::ZWIFT_SYNC_RX_UUID, PROP_WRITE),
                    CharacteristicSpec::new(uuids::ZWIFT_ASYNC_TX_UUID, PROP_NOTIFY),
                    CharacteristicSpec::new(uuids::ZWIFT_SYNC_TX_UUID, PROP_NOTIFY),
                ],
            )
            .unwrap();
        mirror
    }

    #[test]
    fn test_registration_order_preserved() {
        let mirror = mirror_with_ride();
        let chars = mirror.characteristics_of(&uuids::ZWIFT_RIDE_SERVICE_UUID).unwrap();
        assert_eq!(
            chars,
            vec![
                (uuids::ZWIFT_SYNC_RX_UUID, PROP_WRITE),
                (uuids::ZWIFT_ASYNC_TX_UUID, PROP_NOTIFY),
                (uuids::ZWIFT_SYNC_TX_UUID, PROP_NOTIFY),
            ]
        );
    }

    #[test]
    fn test_duplicate_service_rejected() {
        let mirror = mirror_with_ride();
        assert_eq!(
            mirror.register_service(uuids::ZWIFT_RIDE_SERVICE_UUID, vec![]),
            Err(MirrorError::DuplicateUuid)
        );
    }

    #[test]
    fn test_duplicate_characteristic_across_services_rejected() {
        let mirror = mirror_with_ride();
        assert_eq!(
            mirror.register_service(
                uuids::FTMS_SERVICE_UUID,
                vec![CharacteristicSpec::new(uuids::ZWIFT_SYNC_RX_UUID, PROP_WRITE)],
            ),
            Err(MirrorError::DuplicateUuid)
        );
    }

    #[test]
    fn test_write_requires_write_property() {
        let mirror = mirror_with_ride();
        assert_eq!(
            mirror.write(&uuids::ZWIFT_SYNC_TX_UUID, &[1]),
            Err(MirrorError::NotSupported)
        );
        // Value untouched by the rejected write.
        assert_eq!(mirror.value(&uuids::ZWIFT_SYNC_TX_UUID).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_write_missing_characteristic() {
        let mirror = mirror_with_ride();
        assert_eq!(
            mirror.write(&uuids::CONTROL_POINT_UUID, &[1]),
            Err(MirrorError::CharacteristicNotFound)
        );
    }

    #[test]
    fn test_zero_length_write_valid() {
        let mirror = mirror_with_ride();
        mirror.write(&uuids::ZWIFT_SYNC_RX_UUID, b"RideOn").unwrap();
        mirror.write(&uuids::ZWIFT_SYNC_RX_UUID, &[]).unwrap();
        assert!(mirror.value(&uuids::ZWIFT_SYNC_RX_UUID).unwrap().is_empty());
    }

    #[test]
    fn test_write_length_cap() {
        let mirror = mirror_with_ride();
        assert!(mirror.write(&uuids::ZWIFT_SYNC_RX_UUID, &vec![0u8; MAX_VALUE_LEN]).is_ok());
        assert_eq!(
            mirror.write(&uuids::ZWIFT_SYNC_RX_UUID, &vec![0u8; MAX_VALUE_LEN + 1]),
            Err(MirrorError::ValueTooLong)
        );
    }

    #[test]
    fn test_handler_runs_after_commit_and_may_reenter() {
        let mirror = Arc::new(GattMirror::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let m = mirror.clone();
        let s = seen.clone();
        mirror
            .register_service(
                uuids::ZWIFT_RIDE_SERVICE_UUID,
                vec![
                    CharacteristicSpec::new(uuids::ZWIFT_SYNC_RX_UUID, PROP_WRITE).with_handler(
                        Arc::new(move |bytes: &[u8]| {
                            // The committed value must already be visible.
                            let committed = m.value(&uuids::ZWIFT_SYNC_RX_UUID).unwrap();
                            assert_eq!(committed, bytes);
                            // Reentrancy: handlers may notify other characteristics.
                            m.notify(&uuids::ZWIFT_SYNC_TX_UUID, &[0x12, 0x00]);
                            s.lock().unwrap().push(bytes.to_vec());
                        }),
                    ),
                    CharacteristicSpec::new(uuids::ZWIFT_SYNC_TX_UUID, PROP_NOTIFY),
                ],
            )
            .unwrap();

        mirror.write(&uuids::ZWIFT_SYNC_RX_UUID, &[0x22]).unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), &[vec![0x22]]);
    }

    #[test]
    fn test_subscribe_requires_notify_or_indicate() {
        let mirror = mirror_with_ride();
        mirror
            .register_service(
                uuids::FTMS_SERVICE_UUID,
                vec![CharacteristicSpec::new(uuids::FTMS_FEATURE_UUID, PROP_READ)],
            )
            .unwrap();
        assert_eq!(
            mirror.subscribe(1, &uuids::FTMS_FEATURE_UUID),
            Err(MirrorError::NotSupported)
        );
        assert!(mirror.subscribe(1, &uuids::ZWIFT_SYNC_TX_UUID).is_ok());
    }

    #[test]
    fn test_drop_session_clears_all_subscriptions() {
        let mirror = mirror_with_ride();
        mirror.subscribe(7, &uuids::ZWIFT_SYNC_TX_UUID).unwrap();
        mirror.subscribe(7, &uuids::ZWIFT_ASYNC_TX_UUID).unwrap();
        mirror.subscribe(8, &uuids::ZWIFT_SYNC_TX_UUID).unwrap();

        mirror.drop_session(7);

        assert_eq!(mirror.subscriber_count(&uuids::ZWIFT_SYNC_TX_UUID), 1);
        assert_eq!(mirror.subscriber_count(&uuids::ZWIFT_ASYNC_TX_UUID), 0);
    }

    #[tokio::test]
    async fn test_notify_reaches_subscriber_sink() {
        let mirror = mirror_with_ride();
        let session = mirror.allocate_session();
        let (tx, mut rx) = GattMirror::notification_channel();
        mirror.add_sink(session, tx);
        mirror.subscribe(session, &uuids::ZWIFT_SYNC_TX_UUID).unwrap();

        mirror.notify(&uuids::ZWIFT_SYNC_TX_UUID, &[0xAA, 0xBB]);

        let n = rx.recv().await.unwrap();
        assert_eq!(n.uuid, uuids::ZWIFT_SYNC_TX_UUID);
        assert_eq!(n.value, vec![0xAA, 0xBB]);
        // Value store updated too.
        assert_eq!(mirror.value(&uuids::ZWIFT_SYNC_TX_UUID).unwrap(), vec![0xAA, 0xBB]);
    }

    #[tokio::test]
    async fn test_notify_skips_non_subscribers() {
        let mirror = mirror_with_ride();
        let session = mirror.allocate_session();
        let (tx, mut rx) = GattMirror::notification_channel();
        mirror.add_sink(session, tx);
        // No subscription: nothing arrives.
        mirror.notify(&uuids::ZWIFT_SYNC_TX_UUID, &[1]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_notify_after_drop_session_is_safe() {
        let mirror = mirror_with_ride();
        let session = mirror.allocate_session();
        let (tx, rx) = GattMirror::notification_channel();
        mirror.add_sink(session, tx);
        mirror.subscribe(session, &uuids::ZWIFT_SYNC_TX_UUID).unwrap();

        drop(rx);
        mirror.drop_session(session);

        // Must neither panic nor attempt delivery to the dead session.
        mirror.notify(&uuids::ZWIFT_SYNC_TX_UUID, &[1, 2, 3]);
        assert_eq!(mirror.subscriber_count(&uuids::ZWIFT_SYNC_TX_UUID), 0);
    }

    #[tokio::test]
    async fn test_notify_full_queue_drops_without_blocking() {
        let mirror = mirror_with_ride();
        let slow = mirror.allocate_session();
        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        mirror.add_sink(slow, slow_tx);
        mirror.subscribe(slow, &uuids::ZWIFT_SYNC_TX_UUID).unwrap();

        let fast = mirror.allocate_session();
        let (fast_tx, mut fast_rx) = GattMirror::notification_channel();
        mirror.add_sink(fast, fast_tx);
        mirror.subscribe(fast, &uuids::ZWIFT_SYNC_TX_UUID).unwrap();

        // Second notify overflows the slow session's depth-1 queue; the
        // fast session still receives both.
        mirror.notify(&uuids::ZWIFT_SYNC_TX_UUID, &[1]);
        mirror.notify(&uuids::ZWIFT_SYNC_TX_UUID, &[2]);

        assert_eq!(fast_rx.recv().await.unwrap().value, vec![1]);
        assert_eq!(fast_rx.recv().await.unwrap().value, vec![2]);
        assert_eq!(slow_rx.recv().await.unwrap().value, vec![1]);
        assert!(slow_rx.try_recv().is_err());
    }

    #[test]
    fn test_session_ids_unique() {
        let mirror = GattMirror::new();
        let a = mirror.allocate_session();
        let b = mirror.allocate_session();
        assert_ne!(a, b);
    }
}
