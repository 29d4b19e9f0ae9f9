//! In-memory transport
//!
//! Records every call in order (with the tokio clock, so paused-time tests
//! can measure delays), and supports scripted failures, hangs and
//! notifications.

use crate::domain::models::PeripheralAddress;
use crate::error::TransportError;
use crate::infrastructure::bluetooth::protocol::{device_info, CharacteristicId, GattProfile};
use crate::infrastructure::bluetooth::transport::{
    BleTransport, Connection, NotificationSink, Subscription, WriteMode,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect(PeripheralAddress),
    Read(CharacteristicId),
    Write {
        characteristic: CharacteristicId,
        payload: Vec<u8>,
        mode: WriteMode,
    },
    Subscribe(CharacteristicId),
    Unsubscribe(CharacteristicId),
    Disconnect,
}

// Only read back by the test helpers
#[cfg_attr(not(test), allow(dead_code))]
#[derive(Debug, Clone)]
struct RecordedCall {
    call: TransportCall,
    at: Instant,
}

/// Where a scripted fault applies
#[cfg_attr(not(test), allow(dead_code))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultPoint {
    Connect,
    Read(CharacteristicId),
    /// Any write to the characteristic, or only writes of `payload` if given
    Write {
        characteristic: CharacteristicId,
        payload: Option<Vec<u8>>,
    },
    Subscribe(CharacteristicId),
}

impl FaultPoint {
    fn matches(&self, call: &TransportCall) -> bool {
        match (self, call) {
            (Self::Connect, TransportCall::Connect(_)) => true,
            (Self::Read(a), TransportCall::Read(b)) => a == b,
            (Self::Subscribe(a), TransportCall::Subscribe(b)) => a == b,
            (
                Self::Write {
                    characteristic,
                    payload,
                },
                TransportCall::Write {
                    characteristic: c,
                    payload: p,
                    ..
                },
            ) => characteristic == c && payload.as_ref().map_or(true, |expected| expected == p),
            _ => false,
        }
    }
}

#[cfg_attr(not(test), allow(dead_code))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FaultKind {
    Fail,
    Hang,
}

#[derive(Debug, Clone)]
struct Fault {
    point: FaultPoint,
    kind: FaultKind,
}

/// Notification pushed once a matching write has been recorded
#[derive(Debug, Clone)]
struct ScriptedNotification {
    after_write: (CharacteristicId, Vec<u8>),
    source: CharacteristicId,
    payload: Vec<u8>,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<RecordedCall>,
    faults: Vec<Fault>,
    scripted: Vec<ScriptedNotification>,
    values: HashMap<CharacteristicId, Vec<u8>>,
    sinks: HashMap<CharacteristicId, NotificationSink>,
    latency: Duration,
    connected: Option<u64>,
    next_id: u64,
}

#[derive(Default)]
pub struct FakeTransport {
    state: Mutex<FakeState>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A camera that answers device-info reads and sends one status
    /// indication after each full press
    pub fn demo_camera() -> Self {
        let profile = GattProfile::default();
        let transport = Self::new()
            .with_value(device_info::MANUFACTURER_NAME, b"Canon Inc.")
            .with_value(device_info::MODEL_NUMBER, b"Canon EOS R6")
            .with_value(device_info::SERIAL_NUMBER, b"")
            .with_value(device_info::SOFTWARE_REVISION, b"1.8.1")
            .with_latency(Duration::from_millis(20));
        transport.notify_after_write(
            profile.shutter,
            vec![0x8C],
            profile.status,
            vec![0x01, 0x00],
        );
        transport
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_value(self, characteristic: CharacteristicId, value: &[u8]) -> Self {
        self.state().values.insert(characteristic, value.to_vec());
        self
    }

    /// Delay applied to every call
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state().latency = latency;
        self
    }

    pub fn notify_after_write(
        &self,
        written_to: CharacteristicId,
        written: Vec<u8>,
        source: CharacteristicId,
        payload: Vec<u8>,
    ) {
        self.state().scripted.push(ScriptedNotification {
            after_write: (written_to, written),
            source,
            payload,
        });
    }

    /// Record `call` and apply latency and faults
    async fn record(&self, call: TransportCall) -> Result<(), TransportError> {
        let (latency, fault) = {
            let mut state = self.state();
            trace!("fake transport: {:?}", call);
            let fault = state
                .faults
                .iter()
                .find(|f| f.point.matches(&call))
                .map(|f| f.kind);
            state.calls.push(RecordedCall {
                call: call.clone(),
                at: Instant::now(),
            });
            (state.latency, fault)
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match fault {
            Some(FaultKind::Fail) => Err(TransportError::Injected(format!("{:?}", call))),
            Some(FaultKind::Hang) => std::future::pending().await,
            None => Ok(()),
        }
    }

    fn ensure_link(&self, conn: &Connection) -> Result<(), TransportError> {
        match (self.state().connected, conn.link_id()) {
            (Some(active), Some(id)) if active == id => Ok(()),
            _ => Err(TransportError::NotConnected),
        }
    }

    fn run_scripted(&self, characteristic: CharacteristicId, payload: &[u8]) {
        let due: Vec<(NotificationSink, CharacteristicId, Vec<u8>)> = {
            let state = self.state();
            state
                .scripted
                .iter()
                .filter(|s| s.after_write.0 == characteristic && s.after_write.1 == payload)
                .filter_map(|s| {
                    state
                        .sinks
                        .get(&s.source)
                        .map(|sink| (sink.clone(), s.source, s.payload.clone()))
                })
                .collect()
        };

        for (sink, source, payload) in due {
            debug!("fake transport: scripted notification on {}", source);
            sink.deliver(source, payload);
        }
    }
}

/// Fault scripting and call inspection for tests
#[cfg(test)]
impl FakeTransport {
    pub fn fail_on(&self, point: FaultPoint) {
        self.state().faults.push(Fault {
            point,
            kind: FaultKind::Fail,
        });
    }

    /// The matching call never completes
    pub fn hang_on(&self, point: FaultPoint) {
        self.state().faults.push(Fault {
            point,
            kind: FaultKind::Hang,
        });
    }

    /// Push a notification into the sink registered for `source`
    pub fn notify(&self, source: CharacteristicId, payload: Vec<u8>) -> bool {
        let sink = self.state().sinks.get(&source).cloned();
        match sink {
            Some(sink) => sink.deliver(source, payload),
            None => false,
        }
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.state().calls.iter().map(|c| c.call.clone()).collect()
    }

    pub fn count(&self, predicate: impl Fn(&TransportCall) -> bool) -> usize {
        self.state().calls.iter().filter(|c| predicate(&c.call)).count()
    }

    pub fn connect_count(&self) -> usize {
        self.count(|c| matches!(c, TransportCall::Connect(_)))
    }

    pub fn disconnect_count(&self) -> usize {
        self.count(|c| matches!(c, TransportCall::Disconnect))
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.count(|c| matches!(c, TransportCall::Unsubscribe(_)))
    }

    /// Payloads written to `characteristic`, with the time of each write
    pub fn writes_to(&self, characteristic: CharacteristicId) -> Vec<(Vec<u8>, Instant)> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match &c.call {
                TransportCall::Write {
                    characteristic: target,
                    payload,
                    ..
                } if *target == characteristic => Some((payload.clone(), c.at)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl BleTransport for FakeTransport {
    async fn connect(&self, address: &PeripheralAddress) -> Result<Connection, TransportError> {
        self.record(TransportCall::Connect(address.clone())).await?;

        let mut state = self.state();
        state.next_id += 1;
        let id = state.next_id;
        state.connected = Some(id);
        Ok(Connection::established(address.clone(), id))
    }

    async fn read(
        &self,
        conn: &Connection,
        characteristic: CharacteristicId,
    ) -> Result<Vec<u8>, TransportError> {
        self.ensure_link(conn)?;
        self.record(TransportCall::Read(characteristic)).await?;
        self.state()
            .values
            .get(&characteristic)
            .cloned()
            .ok_or(TransportError::CharacteristicNotFound(characteristic))
    }

    async fn write(
        &self,
        conn: &Connection,
        characteristic: CharacteristicId,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        self.ensure_link(conn)?;
        self.record(TransportCall::Write {
            characteristic,
            payload: payload.to_vec(),
            mode,
        })
        .await?;
        self.run_scripted(characteristic, payload);
        Ok(())
    }

    async fn subscribe(
        &self,
        conn: &Connection,
        characteristic: CharacteristicId,
        sink: NotificationSink,
    ) -> Result<Subscription, TransportError> {
        self.ensure_link(conn)?;
        self.record(TransportCall::Subscribe(characteristic)).await?;

        let mut state = self.state();
        state.sinks.insert(characteristic, sink);
        state.next_id += 1;
        Ok(Subscription {
            id: state.next_id,
            link_id: conn.link_id().unwrap_or_default(),
            characteristic,
        })
    }

    async fn unsubscribe(&self, subscription: Subscription) -> Result<(), TransportError> {
        self.record(TransportCall::Unsubscribe(subscription.characteristic))
            .await?;
        self.state().sinks.remove(&subscription.characteristic);
        Ok(())
    }

    async fn disconnect(&self, conn: &Connection) -> Result<(), TransportError> {
        self.record(TransportCall::Disconnect).await?;

        let mut state = self.state();
        if state.connected.is_some() && state.connected == conn.link_id() {
            state.connected = None;
        }
        state.sinks.clear();
        Ok(())
    }
}
