//! One push connection: an outbound queue plus two pumps.
//!
//! The inbound pump only watches for the socket going away and then
//! unregisters from the hub. The outbound pump owns the write half: it drains
//! the queue the hub fills, keeps the peer alive with pings, and sends a close
//! frame once the hub closes the queue. When the outbound pump stops, for any
//! reason, it tells the inbound pump, which then lets go of the read half so
//! the socket itself is closed.

use crate::error::WriteError;
use crate::hub::{ConnectionId, HubHandle};
use crate::message::Message;
use axum::extract::ws::{Message as Frame, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::mpsc::{self, Receiver};
use tokio::sync::oneshot;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Messages a connection may have queued before the hub drops it.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Deadline and liveness settings for a connection's outbound pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Longest a single frame write may take.
    pub write_wait: Duration,
    /// Window within which the peer is expected to answer; pings go out at 9/10 of it.
    pub pong_wait: Duration,
}

impl Timings {
    pub fn ping_period(&self) -> Duration {
        self.pong_wait * 9 / 10
    }
}

impl Default for Timings {
    fn default() -> Self {
        Timings {
            write_wait: Duration::from_secs(10),
            pong_wait: Duration::from_secs(60),
        }
    }
}

/// Drives an upgraded websocket until it closes.
///
/// Registers with the hub, spawns the outbound pump, and runs the inbound pump
/// on the current task.
pub async fn run_connection(socket: WebSocket, hub: HubHandle, timings: Timings) {
    let id = hub.next_id();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    if let Err(e) = hub.register(id, outbound_tx).await {
        warn!("Could not register {}: {}", id, e);
        return;
    }

    let (sink, stream) = socket.split();
    drive(id, outbound_rx, sink, stream, hub, timings).await;
}

/// Runs both pumps of a registered connection until the socket is released.
///
/// The outbound pump runs on its own task and drops the stop sender when it
/// returns. The inbound pump runs here and returns on the peer's close, a read
/// error, or that stop signal. The socket closes once both pumps are done.
pub async fn drive<Si, St, E>(
    id: ConnectionId,
    outbound: Receiver<Message>,
    sink: Si,
    stream: St,
    hub: HubHandle,
    timings: Timings,
) where
    Si: Sink<Frame> + Send + Unpin + 'static,
    Si::Error: Display + Send,
    St: Stream<Item = Result<Frame, E>> + Unpin,
    E: Display,
{
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        write_pump(id, outbound, sink, timings).await;
        drop(stop_tx);
    });
    read_pump(id, stream, stop_rx, hub).await;
}

/// Discards inbound frames until the peer goes away or `stopped` fires, then
/// unregisters `id`.
///
/// `stopped` resolves once its sender is dropped, which is how the outbound
/// pump reports that it is done with the socket.
pub async fn read_pump<S, E>(
    id: ConnectionId,
    mut stream: S,
    mut stopped: oneshot::Receiver<()>,
    hub: HubHandle,
) where
    S: Stream<Item = Result<Frame, E>> + Unpin,
    E: Display,
{
    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Frame::Close(_))) => {
                    debug!("{} sent a close frame.", id);
                    break;
                }
                Some(Ok(_)) => {
                    debug!("Discarding inbound frame from {}.", id);
                }
                Some(Err(e)) => {
                    debug!("Read from {} failed: {}", id, e);
                    break;
                }
                None => break,
            },
            _ = &mut stopped => {
                debug!("Outbound pump for {} stopped, releasing the socket.", id);
                break;
            }
        }
    }

    info!("{} disconnected.", id);
    if let Err(e) = hub.unregister(id).await {
        warn!("Could not unregister {}: {}", id, e);
    }
    // Dropping the stream releases this half of the socket.
}

/// Writes queued messages and keepalive pings to `sink`.
///
/// Returns once the queue is closed (after sending a close frame) or once any
/// write fails or misses its deadline.
pub async fn write_pump<S>(
    id: ConnectionId,
    mut outbound: Receiver<Message>,
    mut sink: S,
    timings: Timings,
) where
    S: Sink<Frame> + Unpin,
    S::Error: Display,
{
    let period = timings.ping_period();
    let mut ping = time::interval_at(Instant::now() + period, period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some(first) = next else {
                    debug!("Outbound queue for {} closed, sending close frame.", id);
                    if let Err(e) = write_frame(&mut sink, Frame::Close(None), timings.write_wait).await {
                        debug!("Close frame to {} not delivered: {}", id, e);
                    }
                    return;
                };
                let frame = coalesce(first, &mut outbound);
                if let Err(e) = write_frame(&mut sink, frame, timings.write_wait).await {
                    warn!("Write to {} failed, stopping outbound pump: {}", id, e);
                    return;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = write_frame(&mut sink, Frame::Ping(Vec::new()), timings.write_wait).await {
                    warn!("Ping to {} failed, stopping outbound pump: {}", id, e);
                    return;
                }
                debug!("Pinged {}.", id);
            }
        }
    }
}

/// Joins `first` with everything already waiting in the queue into one frame.
fn coalesce(first: Message, outbound: &mut Receiver<Message>) -> Frame {
    let mut buf = first.as_bytes().to_vec();
    // Bounded so a producer racing the drain cannot keep us here.
    for _ in 1..OUTBOUND_CAPACITY {
        let Ok(next) = outbound.try_recv() else {
            break;
        };
        buf.push(b'\n');
        buf.extend_from_slice(next.as_bytes());
    }
    match String::from_utf8(buf) {
        Ok(text) => Frame::Text(text),
        Err(e) => Frame::Binary(e.into_bytes()),
    }
}

async fn write_frame<S>(sink: &mut S, frame: Frame, deadline: Duration) -> Result<(), WriteError>
where
    S: Sink<Frame> + Unpin,
    S::Error: Display,
{
    match time::timeout(deadline, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(WriteError::Socket(e.to_string())),
        Err(_) => Err(WriteError::Deadline(deadline)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use futures_util::{sink, stream};
    use std::io;
    use std::pin::Pin;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use tokio::task::JoinHandle;

    type TestSink = Pin<Box<dyn Sink<Frame, Error = io::Error> + Send>>;

    /// A sink that forwards every frame into a channel the test can read.
    fn recording_sink() -> (TestSink, UnboundedReceiver<Frame>) {
        let (tx, rx) = unbounded_channel();
        let sink: TestSink = Box::pin(sink::unfold(tx, |tx, frame: Frame| async move {
            tx.send(frame)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "reader gone"))?;
            Ok::<_, io::Error>(tx)
        }));
        (sink, rx)
    }

    fn spawn_pump(outbound: Receiver<Message>, sink: TestSink) -> JoinHandle<()> {
        let (_hub, handle) = Hub::new();
        tokio::spawn(write_pump(
            handle.next_id(),
            outbound,
            sink,
            Timings::default(),
        ))
    }

    fn text(frame: Frame) -> String {
        match frame {
            Frame::Text(text) => text,
            other => panic!("expected a text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn delivers_a_queued_message_as_text() {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (sink, mut frames) = recording_sink();
        let pump = spawn_pump(rx, sink);

        tx.send(Message::reload()).await.unwrap();
        assert_eq!(text(frames.recv().await.unwrap()), "reload");

        drop(tx);
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn batches_everything_already_queued() {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        for payload in ["a", "b", "c"] {
            tx.try_send(Message::from(payload)).unwrap();
        }
        let (sink, mut frames) = recording_sink();
        let pump = spawn_pump(rx, sink);

        assert_eq!(text(frames.recv().await.unwrap()), "a\nb\nc");
        drop(tx);
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn closed_queue_sends_close_frame_and_stops() {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (sink, mut frames) = recording_sink();
        let pump = spawn_pump(rx, sink);

        drop(tx);
        pump.await.unwrap();

        assert!(matches!(frames.recv().await, Some(Frame::Close(None))));
        // The pump dropped the sink, so nothing else can ever be written.
        assert!(frames.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn pings_at_nine_tenths_of_the_pong_window() {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (sink, mut frames) = recording_sink();
        let pump = spawn_pump(rx, sink);

        time::sleep(Duration::from_secs(53)).await;
        assert!(frames.try_recv().is_err());

        time::sleep(Duration::from_secs(2)).await;
        assert!(matches!(frames.recv().await, Some(Frame::Ping(_))));

        drop(tx);
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn write_failure_ends_the_pump() {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (sink, frames) = recording_sink();
        drop(frames);
        let pump = spawn_pump(rx, sink);

        tx.send(Message::reload()).await.unwrap();
        pump.await.unwrap();
        assert!(tx.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_socket_hits_the_write_deadline() {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let stalled: TestSink = Box::pin(sink::unfold((), |_, _frame: Frame| {
            futures_util::future::pending::<Result<(), io::Error>>()
        }));
        let started = Instant::now();
        let pump = spawn_pump(rx, stalled);

        tx.send(Message::reload()).await.unwrap();
        pump.await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn read_pump_unregisters_on_close_frame() {
        let handle = Hub::spawn();
        let id = handle.next_id();
        let (tx, mut rx) = mpsc::channel(OUTBOUND_CAPACITY);
        handle.register(id, tx).await.unwrap();

        let inbound = stream::iter(vec![
            Ok::<_, io::Error>(Frame::Text("hello".to_owned())),
            Ok(Frame::Pong(Vec::new())),
            Ok(Frame::Close(None)),
            Ok(Frame::Text("never read".to_owned())),
        ]);
        let (_stop_tx, stop_rx) = oneshot::channel();
        read_pump(id, inbound, stop_rx, handle.clone()).await;

        assert!(handle.active_connections().await.unwrap().is_empty());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn read_pump_unregisters_on_read_error() {
        let handle = Hub::spawn();
        let id = handle.next_id();
        let (tx, _rx) = mpsc::channel(OUTBOUND_CAPACITY);
        handle.register(id, tx).await.unwrap();

        let inbound = stream::iter(vec![Err::<Frame, _>(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset",
        ))]);
        let (_stop_tx, stop_rx) = oneshot::channel();
        read_pump(id, inbound, stop_rx, handle.clone()).await;

        assert!(handle.active_connections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_pump_stops_when_the_outbound_side_is_done() {
        let handle = Hub::spawn();
        let id = handle.next_id();
        let (tx, _rx) = mpsc::channel(OUTBOUND_CAPACITY);
        handle.register(id, tx).await.unwrap();

        let (stop_tx, stop_rx) = oneshot::channel();
        let reader = tokio::spawn(read_pump(
            id,
            stream::pending::<Result<Frame, io::Error>>(),
            stop_rx,
            handle.clone(),
        ));
        drop(stop_tx);

        time::timeout(Duration::from_secs(5), reader)
            .await
            .expect("read pump kept a silent socket open")
            .unwrap();
        assert!(handle.active_connections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_failure_releases_the_connection() {
        let handle = Hub::spawn();
        let id = handle.next_id();
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        handle.register(id, tx.clone()).await.unwrap();

        let (sink, frames) = recording_sink();
        drop(frames);
        let connection = tokio::spawn(drive(
            id,
            rx,
            sink,
            stream::pending::<Result<Frame, io::Error>>(),
            handle.clone(),
            Timings::default(),
        ));

        // Pushed straight into the queue, so no broadcast is around to prune it.
        tx.send(Message::reload()).await.unwrap();
        time::timeout(Duration::from_secs(5), connection)
            .await
            .expect("inbound pump outlived a failed write")
            .unwrap();
        assert!(handle.active_connections().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missed_ping_deadline_releases_the_connection() {
        let handle = Hub::spawn();
        let id = handle.next_id();
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        handle.register(id, tx).await.unwrap();

        let stalled: TestSink = Box::pin(sink::unfold((), |_, _frame: Frame| {
            futures_util::future::pending::<Result<(), io::Error>>()
        }));
        let started = Instant::now();
        drive(
            id,
            rx,
            stalled,
            stream::pending::<Result<Frame, io::Error>>(),
            handle.clone(),
            Timings::default(),
        )
        .await;

        assert!(started.elapsed() >= Duration::from_secs(64));
        assert!(handle.active_connections().await.unwrap().is_empty());
    }

    #[test]
    fn ping_period_is_nine_tenths() {
        assert_eq!(Timings::default().ping_period(), Duration::from_secs(54));
    }
}
