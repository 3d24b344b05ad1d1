//! Motion Controller
//!
//! Every command for a bed goes through one dispatcher task and one FIFO
//! queue, so a burst of button presses and estimator stops reaches the bed
//! in the order it was submitted and is never dropped. Spacing between
//! writes is enforced by the session's write gate, which the PIN keep-alive
//! shares.

use crate::domain::models::{Axis, BedEvent, Command, Direction, HandshakeState};
use crate::error::BedError;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::session::BleSession;
use crate::infrastructure::bluetooth::transport::BleTransport;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Dispatch {
    command: Command,
    bytes: &'static [u8],
    reply: oneshot::Sender<Result<(), BedError>>,
}

/// Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct MotionController {
    queue: mpsc::UnboundedSender<Dispatch>,
    handshake: watch::Receiver<HandshakeState>,
    light: Arc<Mutex<Option<bool>>>,
    dispatcher: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MotionController {
    pub fn new<T: BleTransport>(
        session: Arc<BleSession<T>>,
        handshake: watch::Receiver<HandshakeState>,
        events: broadcast::Sender<BedEvent>,
    ) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let light = Arc::new(Mutex::new(None));
        let dispatcher = tokio::spawn(dispatch_loop(
            session,
            rx,
            handshake.clone(),
            events,
            light.clone(),
        ));

        Self {
            queue,
            handshake,
            light,
            dispatcher: Arc::new(Mutex::new(Some(dispatcher))),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        *self.handshake.borrow() == HandshakeState::Authenticated
    }

    /// Last light state confirmed by a successful write, if any.
    pub fn light_state(&self) -> Option<bool> {
        self.light.lock().ok().and_then(|light| *light)
    }

    /// Queue `command` and wait until it has been written.
    pub async fn send(&self, command: Command) -> Result<(), BedError> {
        let bytes =
            protocol::encode_command(command).ok_or(BedError::UnsupportedCommand(command))?;
        if !self.is_authenticated() {
            return Err(BedError::SessionNotAuthenticated);
        }

        let (reply, done) = oneshot::channel();
        self.queue
            .send(Dispatch {
                command,
                bytes,
                reply,
            })
            .map_err(|_| BedError::NotConnected)?;
        // A dropped reply means the queue was shut down with this command pending.
        done.await.map_err(|_| BedError::NotConnected)?
    }

    /// Drive `axis` for `duration`, then stop. The stop is sent even if the
    /// caller stops waiting.
    pub async fn move_for(
        &self,
        axis: Axis,
        direction: Direction,
        duration: Duration,
    ) -> Result<(), BedError> {
        self.send(axis.move_command(direction)).await?;

        let controller = self.clone();
        let hold = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            controller.send(Command::Stop).await
        });
        hold.await.map_err(|_| BedError::NotConnected)?
    }

    pub async fn head_up(&self) -> Result<(), BedError> {
        self.send(Command::MoveHead(Direction::Up)).await
    }

    pub async fn head_down(&self) -> Result<(), BedError> {
        self.send(Command::MoveHead(Direction::Down)).await
    }

    pub async fn feet_up(&self) -> Result<(), BedError> {
        self.send(Command::MoveFeet(Direction::Up)).await
    }

    pub async fn feet_down(&self) -> Result<(), BedError> {
        self.send(Command::MoveFeet(Direction::Down)).await
    }

    pub async fn both_up(&self) -> Result<(), BedError> {
        self.send(Command::MoveBoth(Direction::Up)).await
    }

    pub async fn both_down(&self) -> Result<(), BedError> {
        self.send(Command::MoveBoth(Direction::Down)).await
    }

    pub async fn head_up_continuous(&self) -> Result<(), BedError> {
        self.send(Command::MomentaryContinuous(Axis::Head, Direction::Up))
            .await
    }

    pub async fn both_up_continuous(&self) -> Result<(), BedError> {
        self.send(Command::MomentaryContinuous(Axis::Both, Direction::Up))
            .await
    }

    pub async fn stop(&self) -> Result<(), BedError> {
        self.send(Command::Stop).await
    }

    pub async fn light_on(&self) -> Result<(), BedError> {
        self.send(Command::LightOn).await
    }

    pub async fn light_off(&self) -> Result<(), BedError> {
        self.send(Command::LightOff).await
    }

    /// Stop the dispatcher. Queued commands fail with `NotConnected`.
    pub fn shutdown(&self) {
        if let Some(handle) = self.dispatcher.lock().ok().and_then(|mut d| d.take()) {
            handle.abort();
        }
    }
}

async fn dispatch_loop<T: BleTransport>(
    session: Arc<BleSession<T>>,
    mut rx: mpsc::UnboundedReceiver<Dispatch>,
    handshake: watch::Receiver<HandshakeState>,
    events: broadcast::Sender<BedEvent>,
    light: Arc<Mutex<Option<bool>>>,
) {
    while let Some(Dispatch {
        command,
        bytes,
        reply,
    }) = rx.recv().await
    {
        if *handshake.borrow() != HandshakeState::Authenticated {
            let _ = reply.send(Err(BedError::SessionNotAuthenticated));
            continue;
        }

        let result = session.write(bytes).await;

        match &result {
            Ok(()) => {
                if command.is_motion() {
                    info!("Dispatched {:?}", command);
                } else {
                    debug!("Dispatched {:?}", command);
                }
                let light_on = match command {
                    Command::LightOn => Some(true),
                    Command::LightOff => Some(false),
                    _ => None,
                };
                if let Some(on) = light_on {
                    info!("Light {}", if on { "on" } else { "off" });
                    if let Ok(mut light) = light.lock() {
                        *light = Some(on);
                    }
                    let _ = events.send(BedEvent::Light(on));
                }
            }
            Err(e) => warn!("Command {:?} failed: {}", command, e),
        }
        let _ = reply.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::handshake::{HandshakeConfig, PinHandshake};
    use crate::infrastructure::bluetooth::mock::MockTransport;
    use tokio::time::Instant;

    struct Fixture {
        transport: MockTransport,
        motion: MotionController,
        events: broadcast::Receiver<BedEvent>,
        _handshake: PinHandshake<MockTransport>,
    }

    async fn fixture() -> Fixture {
        let transport = MockTransport::auto_ack();
        let session = BleSession::new(transport.clone(), "AA:BB:CC:DD:EE:FF");
        session.open(Duration::from_secs(15)).await.unwrap();
        let handshake = PinHandshake::new(session.clone(), HandshakeConfig::default()).unwrap();
        handshake.authenticate("1234").await.unwrap();

        let (events_tx, events) = broadcast::channel(64);
        let motion = MotionController::new(session, handshake.subscribe_state(), events_tx);
        Fixture {
            transport,
            motion,
            events,
            _handshake: handshake,
        }
    }

    fn bytes(command: Command) -> Vec<u8> {
        protocol::encode_command(command).unwrap().to_vec()
    }

    #[tokio::test(start_paused = true)]
    async fn test_requires_authentication() {
        let transport = MockTransport::auto_ack();
        let session = BleSession::new(transport.clone(), "AA:BB:CC:DD:EE:FF");
        session.open(Duration::from_secs(15)).await.unwrap();
        let handshake = PinHandshake::new(session.clone(), HandshakeConfig::default()).unwrap();
        let (events, _) = broadcast::channel(8);
        let motion = MotionController::new(session, handshake.subscribe_state(), events);

        assert_eq!(
            motion.head_up().await,
            Err(BedError::SessionNotAuthenticated)
        );
        assert!(transport.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_keep_submission_order() {
        let f = fixture().await;
        // The first write is slow; later ones must still wait their turn.
        f.transport.set_write_latencies(vec![
            Duration::from_millis(900),
            Duration::from_millis(10),
            Duration::from_millis(10),
        ]);

        let (a, b, c) = tokio::join!(
            f.motion.send(Command::MoveHead(Direction::Up)),
            f.motion.send(Command::MoveFeet(Direction::Down)),
            f.motion.send(Command::Stop),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        assert_eq!(
            f.transport.commands(),
            vec![
                bytes(Command::MoveHead(Direction::Up)),
                bytes(Command::MoveFeet(Direction::Down)),
                bytes(Command::Stop),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_minimum_spacing() {
        let f = fixture().await;
        let (a, b, c) = tokio::join!(f.motion.head_up(), f.motion.head_down(), f.motion.stop());
        a.unwrap();
        b.unwrap();
        c.unwrap();

        let times: Vec<Instant> = f
            .transport
            .writes()
            .into_iter()
            .filter(|w| !crate::infrastructure::bluetooth::mock::is_pin_payload(&w.data))
            .map(|w| w.at)
            .collect();
        assert_eq!(times.len(), 3);
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(200));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_is_not_auto_stopped() {
        let f = fixture().await;
        f.motion.head_up_continuous().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(
            f.transport.commands(),
            vec![bytes(Command::MomentaryContinuous(Axis::Head, Direction::Up))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_light_state_tracked() {
        let mut f = fixture().await;
        assert_eq!(f.motion.light_state(), None);

        f.motion.light_on().await.unwrap();
        assert_eq!(f.motion.light_state(), Some(true));
        assert_eq!(f.events.recv().await.unwrap(), BedEvent::Light(true));

        f.transport.fail_next_writes(1);
        assert!(f.motion.light_off().await.is_err());
        assert_eq!(f.motion.light_state(), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_for_sends_stop() {
        let f = fixture().await;
        let started = Instant::now();
        f.motion
            .move_for(Axis::Feet, Direction::Down, Duration::from_secs(3))
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(
            f.transport.commands(),
            vec![
                bytes(Command::MoveFeet(Direction::Down)),
                bytes(Command::Stop),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_fails_pending() {
        let f = fixture().await;
        f.motion.shutdown();
        assert_eq!(f.motion.stop().await, Err(BedError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_queued_commands() {
        let f = fixture().await;
        let motion = f.motion.clone();
        let shutdown = async {
            // The first command is on the wire; the second waits out the spacing.
            tokio::time::sleep(Duration::from_millis(300)).await;
            motion.shutdown();
        };

        let (first, second, ()) = tokio::join!(f.motion.head_up(), f.motion.head_down(), shutdown);
        assert_eq!(first, Ok(()));
        assert_eq!(second, Err(BedError::NotConnected));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.transport.commands(), vec![bytes(Command::MoveHead(Direction::Up))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_command_leaves_queue_usable() {
        let f = fixture().await;
        let command = Command::MomentaryContinuous(Axis::Feet, Direction::Down);
        assert_eq!(
            f.motion.send(command).await,
            Err(BedError::UnsupportedCommand(command))
        );

        f.motion.stop().await.unwrap();
        assert!(f.motion.is_authenticated());
        assert_eq!(f.transport.commands(), vec![bytes(Command::Stop)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_shares_spacing_with_commands() {
        let f = fixture().await;
        // Lands just before the first keep-alive is due.
        tokio::time::sleep(Duration::from_millis(19_950)).await;
        f.motion.head_up().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let writes = f.transport.writes();
        assert_eq!(f.transport.pin_writes(), 2);
        assert_eq!(writes.len(), 3);
        for pair in writes.windows(2) {
            assert!(
                pair[1].at - pair[0].at >= Duration::from_millis(200),
                "writes {:?} apart",
                pair[1].at - pair[0].at
            );
        }
    }
}
