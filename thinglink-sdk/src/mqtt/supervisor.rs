use super::TransportEvent;
use crate::{build_exponential_backoff, RetryPolicy};
use backoff::backoff::Backoff;
use rumqttc::{Event, EventLoop, Outgoing, Packet};
use std::time::Duration;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FLUSH_WINDOW: Duration = Duration::from_millis(500);

/// Drives the rumqttc event loop for one engine link.
///
/// - Translates broker traffic into [`TransportEvent`]s, in arrival order
/// - Lets rumqttc reconnect on the next poll after an error, pacing attempts
///   with exponential backoff
/// - Emits `Failed` and stops once the retry policy is exhausted
///
/// # Max Attempts Semantics
/// - `None` or `Some(0)`: reconnect forever
/// - `Some(n)`: give up after `n` consecutive failed polls without a session
pub(crate) struct MqttSupervisor {
    event_loop: EventLoop,
    retry_policy: RetryPolicy,
    cancel: CancellationToken,
    events_tx: mpsc::Sender<TransportEvent>,
}

impl MqttSupervisor {
    pub fn new(
        event_loop: EventLoop,
        retry_policy: RetryPolicy,
        cancel: CancellationToken,
        events_tx: mpsc::Sender<TransportEvent>,
    ) -> Self {
        Self {
            event_loop,
            retry_policy,
            cancel,
            events_tx,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut bo = build_exponential_backoff(&self.retry_policy);
        let mut failures: u32 = 0;
        let mut connected = false;

        loop {
            let polled = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("MQTT supervisor cancelled");
                    if connected {
                        self.flush_disconnect().await;
                    }
                    break;
                }
                polled = self.event_loop.poll() => polled,
            };

            let event = match polled {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, failures, "MQTT event loop error");
                    if connected {
                        connected = false;
                        if !self.emit(TransportEvent::ConnectionLost(Some(e.to_string()))).await {
                            break;
                        }
                    }

                    failures += 1;
                    if !self.retry_policy.allows_attempt(failures) {
                        warn!(
                            max_attempts = ?self.retry_policy.max_attempts,
                            "MQTT supervisor exhausted retry attempts"
                        );
                        let reason = format!(
                            "Max retry attempts ({:?}) exhausted: {e}",
                            self.retry_policy.max_attempts
                        );
                        let _ = self.emit(TransportEvent::Failed(reason)).await;
                        break;
                    }

                    match bo.next_backoff() {
                        Some(delay) => {
                            info!(
                                failures,
                                delay_ms = delay.as_millis() as u64,
                                "MQTT reconnect backoff"
                            );
                            tokio::select! {
                                _ = self.cancel.cancelled() => {
                                    info!("Reconnect backoff cancelled");
                                    break;
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        None => {
                            warn!("Exponential backoff exhausted during reconnect");
                            let _ = self
                                .emit(TransportEvent::Failed("Backoff time exhausted".to_string()))
                                .await;
                            break;
                        }
                    }
                    continue;
                }
            };

            let forwarded = match event {
                Event::Incoming(Packet::ConnAck(ack)) => {
                    info!(session_present = ack.session_present, "MQTT connection established");
                    connected = true;
                    failures = 0;
                    bo.reset();
                    Some(TransportEvent::Connected)
                }
                Event::Incoming(Packet::Publish(publish)) => Some(TransportEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload,
                }),
                Event::Incoming(Packet::PubAck(ack)) => Some(TransportEvent::DeliveryComplete(ack.pkid)),
                Event::Incoming(Packet::PubComp(comp)) => {
                    Some(TransportEvent::DeliveryComplete(comp.pkid))
                }
                Event::Incoming(Packet::Disconnect) => {
                    info!("MQTT server sent disconnect");
                    connected = false;
                    Some(TransportEvent::ConnectionLost(Some(
                        "MQTT server sent disconnect".to_string(),
                    )))
                }
                Event::Incoming(Packet::PingResp) => {
                    debug!("MQTT ping response received");
                    None
                }
                Event::Incoming(other) => {
                    debug!(packet = ?other, "MQTT incoming packet");
                    None
                }
                Event::Outgoing(outgoing) => {
                    debug!(outgoing = ?outgoing, "MQTT outgoing event");
                    None
                }
            };

            if let Some(event) = forwarded {
                if !self.emit(event).await {
                    break;
                }
            }
        }

        info!("MQTT supervisor loop terminated");
    }

    /// Give a queued DISCONNECT a short window to reach the broker.
    async fn flush_disconnect(&mut self) {
        let deadline = tokio::time::Instant::now() + FLUSH_WINDOW;
        while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, self.event_loop.poll()).await {
            if matches!(event, Event::Outgoing(Outgoing::Disconnect)) {
                debug!("MQTT disconnect flushed");
                break;
            }
        }
    }

    /// Forward an event to the engine. Returns `false` once the engine is gone.
    async fn emit(&mut self, event: TransportEvent) -> bool {
        if self.events_tx.send(event).await.is_err() {
            warn!("Events channel closed, terminating event loop");
            return false;
        }
        true
    }
}
