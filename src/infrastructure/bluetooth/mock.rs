//! In-memory transport used by the unit tests.

use crate::error::TransportError;
use crate::infrastructure::bluetooth::protocol::{self, NOTIFY_HANDLE, PIN_PREFIX};
use crate::infrastructure::bluetooth::transport::{BleTransport, TransportEvent};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const PIN_ACCEPTED: [u8; 8] = [0x40, 0x21, 0x43, 0x00, 0x01, 0x1a, 0x01, 0x40];
pub const PIN_REJECTED: [u8; 8] = [0x40, 0x21, 0x43, 0x00, 0x01, 0x1b, 0x00, 0x40];

#[derive(Debug, Clone)]
pub struct RecordedWrite {
    pub at: Instant,
    pub handle: u16,
    pub data: Vec<u8>,
}

#[derive(Default)]
struct MockState {
    writes: Vec<RecordedWrite>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    fail_next_writes: u32,
    fail_all_writes: bool,
    connect_error: Option<TransportError>,
    connect_delay: Option<Duration>,
    write_latencies: Vec<Duration>,
    pin_reply: Option<Vec<u8>>,
    connected: bool,
    disconnect_calls: u32,
}

/// Shared handle: clones observe the same state.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that acknowledges every PIN write with an "accepted" notification.
    pub fn auto_ack() -> Self {
        let transport = Self::new();
        transport.set_pin_reply(Some(PIN_ACCEPTED.to_vec()));
        transport
    }

    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn set_pin_reply(&self, reply: Option<Vec<u8>>) {
        self.with(|s| s.pin_reply = reply);
    }

    pub fn set_connect_error(&self, error: TransportError) {
        self.with(|s| s.connect_error = Some(error));
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.with(|s| s.connect_delay = Some(delay));
    }

    pub fn fail_next_writes(&self, count: u32) {
        self.with(|s| s.fail_next_writes = count);
    }

    pub fn set_fail_all_writes(&self, fail: bool) {
        self.with(|s| s.fail_all_writes = fail);
    }

    /// Latencies applied to successive writes, in order.
    pub fn set_write_latencies(&self, latencies: Vec<Duration>) {
        self.with(|s| s.write_latencies = latencies);
    }

    pub fn notify(&self, data: &[u8]) {
        self.with(|s| {
            if let Some(events) = &s.events {
                let _ = events.send(TransportEvent::Notification {
                    handle: NOTIFY_HANDLE,
                    data: data.to_vec(),
                });
            }
        });
    }

    pub fn drop_link(&self) {
        self.with(|s| {
            s.connected = false;
            if let Some(events) = s.events.take() {
                let _ = events.send(TransportEvent::Disconnected);
            }
        });
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.with(|s| s.writes.clone())
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.with(|s| s.writes.iter().map(|w| w.data.clone()).collect())
    }

    /// Writes that are not PIN payloads.
    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.written()
            .into_iter()
            .filter(|w| !is_pin_payload(w))
            .collect()
    }

    pub fn pin_writes(&self) -> usize {
        self.written().iter().filter(|w| is_pin_payload(w)).count()
    }

    pub fn is_connected(&self) -> bool {
        self.with(|s| s.connected)
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.with(|s| s.disconnect_calls)
    }
}

pub fn is_pin_payload(data: &[u8]) -> bool {
    data.len() == protocol::PIN_PAYLOAD_LEN && data.starts_with(&PIN_PREFIX)
}

impl BleTransport for MockTransport {
    async fn connect(&self, _address: &str) -> Result<(), TransportError> {
        let delay = self.with(|s| s.connect_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.with(|s| match s.connect_error.clone() {
            Some(error) => Err(error),
            None => {
                s.connected = true;
                Ok(())
            }
        })
    }

    async fn subscribe(
        &self,
        _handle: u16,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.with(|s| s.events = Some(tx));
        Ok(rx)
    }

    async fn write(&self, handle: u16, data: &[u8]) -> Result<(), TransportError> {
        let latency = self.with(|s| {
            if s.write_latencies.is_empty() {
                None
            } else {
                Some(s.write_latencies.remove(0))
            }
        });
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        self.with(|s| {
            if !s.connected {
                return Err(TransportError::NotConnected);
            }
            if s.fail_all_writes {
                return Err(TransportError::WriteFailed("injected".into()));
            }
            if s.fail_next_writes > 0 {
                s.fail_next_writes -= 1;
                return Err(TransportError::WriteFailed("injected".into()));
            }

            s.writes.push(RecordedWrite {
                at: Instant::now(),
                handle,
                data: data.to_vec(),
            });

            if is_pin_payload(data) {
                if let (Some(reply), Some(events)) = (&s.pin_reply, &s.events) {
                    let _ = events.send(TransportEvent::Notification {
                        handle: NOTIFY_HANDLE,
                        data: reply.clone(),
                    });
                }
            }
            Ok(())
        })
    }

    async fn disconnect(&self) {
        self.with(|s| {
            s.connected = false;
            s.events = None;
            s.disconnect_calls += 1;
        });
    }
}
