//! Status indications
//!
//! Enabling writes the indication bitmask to the status configuration
//! characteristic, registers a sink on the status characteristic and starts
//! a forwarder task that logs every event and hands it to the application.
//! The transport only ever touches the unbounded sink, so slow consumers
//! never hold up delivery.

use crate::domain::models::{AppEvent, NotificationEvent};
use crate::error::{SessionError, TransportError};
use crate::infrastructure::bluetooth::protocol::{GattProfile, ENABLE_INDICATIONS};
use crate::infrastructure::bluetooth::transport::{Link, NotificationSink, Subscription, WriteMode};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// How long the forwarder gets to drain queued events after unsubscribing
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// A live subscription plus the task forwarding its events
#[derive(Debug)]
pub struct NotificationChannel {
    subscription: Subscription,
    forwarder: JoinHandle<usize>,
}

async fn forward_events(
    mut rx: mpsc::UnboundedReceiver<NotificationEvent>,
    profile: GattProfile,
    events: mpsc::UnboundedSender<AppEvent>,
) -> usize {
    let mut forwarded = 0;
    while let Some(event) = rx.recv().await {
        info!(
            role = profile.role_of(event.source),
            "{}",
            event
        );
        forwarded += 1;
        // The receiving side may already be gone during shutdown
        let _ = events.send(AppEvent::Notification(event));
    }
    forwarded
}

/// Turn on status indications.
///
/// The channel is stored into `slot` as soon as the subscription exists, so
/// an interrupted settle still leaves it for the caller to tear down.
pub async fn enable_notifications(
    link: &Link<'_>,
    profile: &GattProfile,
    events: mpsc::UnboundedSender<AppEvent>,
    settle: Duration,
    slot: &mut Option<NotificationChannel>,
) -> Result<(), SessionError> {
    link.write(profile.status_cccd, &ENABLE_INDICATIONS, WriteMode::WithResponse)
        .await
        .map_err(SessionError::SubscribeError)?;

    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = link
        .subscribe(profile.status, NotificationSink::new(tx))
        .await
        .map_err(SessionError::SubscribeError)?;

    let forwarder = tokio::spawn(forward_events(rx, profile.clone(), events));
    *slot = Some(NotificationChannel {
        subscription,
        forwarder,
    });

    tokio::time::sleep(settle).await;
    info!("Indications enabled");
    Ok(())
}

/// Unsubscribe and stop the forwarder. Returns how many events were forwarded.
pub async fn disable_notifications(
    link: &Link<'_>,
    channel: NotificationChannel,
) -> Result<usize, TransportError> {
    let NotificationChannel {
        subscription,
        mut forwarder,
    } = channel;

    let source = subscription.characteristic();
    let result = link.unsubscribe(subscription).await;

    // Once the transport drops its sink the forwarder drains and exits
    let forwarded = match tokio::time::timeout(DRAIN_TIMEOUT, &mut forwarder).await {
        Ok(Ok(count)) => count,
        _ => {
            forwarder.abort();
            0
        }
    };
    debug!(
        "Notification forwarder for {} stopped after {} events",
        source, forwarded
    );

    result.map(|()| forwarded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::PeripheralAddress;
    use crate::infrastructure::bluetooth::fake_transport::{FakeTransport, FaultPoint, TransportCall};
    use crate::infrastructure::bluetooth::transport::BleTransport;

    #[tokio::test(start_paused = true)]
    async fn test_enable_writes_cccd_then_subscribes_and_settles() {
        let transport = FakeTransport::new();
        let profile = GattProfile::default();
        let conn = transport
            .connect(&PeripheralAddress::parse("DC:FE:23:4A:E0:36").unwrap())
            .await
            .unwrap();
        let link = Link::new(&transport, &conn, Duration::from_secs(1));
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let mut slot = None;

        let started = tokio::time::Instant::now();
        enable_notifications(
            &link,
            &profile,
            events_tx,
            Duration::from_millis(500),
            &mut slot,
        )
        .await
        .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(500));

        assert_eq!(
            transport.calls()[1..],
            [
                TransportCall::Write {
                    characteristic: profile.status_cccd,
                    payload: vec![0x02, 0x00],
                    mode: WriteMode::WithResponse,
                },
                TransportCall::Subscribe(profile.status),
            ]
        );
        assert!(slot.is_some());
    }

    #[tokio::test]
    async fn test_events_are_forwarded_intact() {
        let transport = FakeTransport::new();
        let profile = GattProfile::default();
        let conn = transport
            .connect(&PeripheralAddress::parse("DC:FE:23:4A:E0:36").unwrap())
            .await
            .unwrap();
        let link = Link::new(&transport, &conn, Duration::from_secs(1));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut slot = None;

        enable_notifications(&link, &profile, events_tx, Duration::ZERO, &mut slot)
            .await
            .unwrap();
        assert!(transport.notify(profile.status, vec![0xAA, 0xBB]));
        assert!(transport.notify(profile.status, vec![0x00, 0x10, 0x20]));

        let mut payloads = Vec::new();
        for _ in 0..2 {
            match events_rx.recv().await {
                Some(AppEvent::Notification(event)) => {
                    assert_eq!(event.source, profile.status);
                    payloads.push(event.payload);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(payloads, vec![vec![0xAA, 0xBB], vec![0x00, 0x10, 0x20]]);

        let channel = slot.take().unwrap();
        let forwarded = disable_notifications(&link, channel).await.unwrap();
        assert_eq!(forwarded, 2);
        assert_eq!(transport.unsubscribe_count(), 1);
    }

    #[tokio::test]
    async fn test_cccd_failure_is_a_subscribe_error() {
        let transport = FakeTransport::new();
        let profile = GattProfile::default();
        transport.fail_on(FaultPoint::Write {
            characteristic: profile.status_cccd,
            payload: None,
        });
        let conn = transport
            .connect(&PeripheralAddress::parse("DC:FE:23:4A:E0:36").unwrap())
            .await
            .unwrap();
        let link = Link::new(&transport, &conn, Duration::from_secs(1));
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let mut slot = None;

        let err = enable_notifications(&link, &profile, events_tx, Duration::ZERO, &mut slot)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::SubscribeError(_)));
        assert!(slot.is_none());
        assert_eq!(
            transport.count(|c| matches!(c, TransportCall::Subscribe(_))),
            0
        );
    }
}
