//! Transport contract
//!
//! The session engine never talks to a BLE stack directly. Everything goes
//! through [`BleTransport`], implemented by the `btleplug` backend for real
//! hardware and by [`FakeTransport`](super::fake_transport::FakeTransport)
//! for tests and dry runs.

use crate::domain::models::{NotificationEvent, PeripheralAddress};
use crate::error::TransportError;
use crate::infrastructure::bluetooth::protocol::CharacteristicId;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// Handle to one link. `link_id` is `None` when the connect attempt never
/// completed; transports must accept such a handle in `disconnect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    address: PeripheralAddress,
    link_id: Option<u64>,
}

impl Connection {
    pub fn established(address: PeripheralAddress, link_id: u64) -> Self {
        Self {
            address,
            link_id: Some(link_id),
        }
    }

    pub fn unestablished(address: PeripheralAddress) -> Self {
        Self {
            address,
            link_id: None,
        }
    }

    pub fn address(&self) -> &PeripheralAddress {
        &self.address
    }

    pub fn link_id(&self) -> Option<u64> {
        self.link_id
    }

    pub fn is_established(&self) -> bool {
        self.link_id.is_some()
    }
}

/// An active notification registration. Consumed by `unsubscribe`.
#[derive(Debug, PartialEq, Eq)]
pub struct Subscription {
    pub(crate) id: u64,
    pub(crate) link_id: u64,
    pub(crate) characteristic: CharacteristicId,
}

impl Subscription {
    pub fn characteristic(&self) -> CharacteristicId {
        self.characteristic
    }
}

/// Receives payloads from the transport's delivery context. Never blocks.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    tx: mpsc::UnboundedSender<NotificationEvent>,
}

impl NotificationSink {
    pub fn new(tx: mpsc::UnboundedSender<NotificationEvent>) -> Self {
        Self { tx }
    }

    /// Timestamp and queue a payload. Returns `false` once the consumer is gone.
    pub fn deliver(&self, source: CharacteristicId, payload: Vec<u8>) -> bool {
        self.tx
            .send(NotificationEvent::received_now(source, payload))
            .is_ok()
    }
}

#[async_trait]
pub trait BleTransport: Send + Sync {
    async fn connect(&self, address: &PeripheralAddress) -> Result<Connection, TransportError>;

    async fn read(
        &self,
        conn: &Connection,
        characteristic: CharacteristicId,
    ) -> Result<Vec<u8>, TransportError>;

    async fn write(
        &self,
        conn: &Connection,
        characteristic: CharacteristicId,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError>;

    async fn subscribe(
        &self,
        conn: &Connection,
        characteristic: CharacteristicId,
        sink: NotificationSink,
    ) -> Result<Subscription, TransportError>;

    async fn unsubscribe(&self, subscription: Subscription) -> Result<(), TransportError>;

    /// Must be idempotent and accept an unestablished connection.
    async fn disconnect(&self, conn: &Connection) -> Result<(), TransportError>;
}

/// Bound a transport call to `limit`
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(limit)),
    }
}

/// A transport bound to one connection, with a per-call deadline
#[derive(Clone, Copy)]
pub struct Link<'a> {
    transport: &'a dyn BleTransport,
    connection: &'a Connection,
    call_timeout: Duration,
}

impl<'a> Link<'a> {
    pub fn new(
        transport: &'a dyn BleTransport,
        connection: &'a Connection,
        call_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            connection,
            call_timeout,
        }
    }

    pub async fn read(&self, characteristic: CharacteristicId) -> Result<Vec<u8>, TransportError> {
        bounded(
            self.call_timeout,
            self.transport.read(self.connection, characteristic),
        )
        .await
    }

    pub async fn write(
        &self,
        characteristic: CharacteristicId,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        bounded(
            self.call_timeout,
            self.transport
                .write(self.connection, characteristic, payload, mode),
        )
        .await
    }

    pub async fn subscribe(
        &self,
        characteristic: CharacteristicId,
        sink: NotificationSink,
    ) -> Result<Subscription, TransportError> {
        bounded(
            self.call_timeout,
            self.transport
                .subscribe(self.connection, characteristic, sink),
        )
        .await
    }

    pub async fn unsubscribe(&self, subscription: Subscription) -> Result<(), TransportError> {
        bounded(self.call_timeout, self.transport.unsubscribe(subscription)).await
    }

    pub async fn disconnect(&self) -> Result<(), TransportError> {
        bounded(self.call_timeout, self.transport.disconnect(self.connection)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let result: Result<(), _> = bounded(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(TransportError::Timeout(Duration::from_millis(50))));
    }

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let result = bounded(Duration::from_secs(1), async { Ok::<_, TransportError>(7) }).await;
        assert_eq!(result, Ok(7));

        let result: Result<(), _> = bounded(Duration::from_secs(1), async {
            Err(TransportError::NotConnected)
        })
        .await;
        assert_eq!(result, Err(TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_sink_delivery_preserves_payload() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = NotificationSink::new(tx);
        let source = CharacteristicId::from_short(0x2A29);

        assert!(sink.deliver(source, vec![0xAA, 0xBB, 0x00, 0x01]));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.source, source);
        assert_eq!(event.payload, vec![0xAA, 0xBB, 0x00, 0x01]);

        drop(rx);
        assert!(!sink.deliver(source, vec![0x01]));
    }
}
