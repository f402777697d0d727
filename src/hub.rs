//! Fan-out of broadcast messages to every connected endpoint.
//!
//! A single task owns the live set. Registration, removal and every delivery
//! attempt go through its command queue, so a publish never observes a set
//! that is being modified and each recipient sees messages in publish order.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    entity::{ConnectionId, Message},
    error::RelayError,
};

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Outbound half of an endpoint connection.
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send(&mut self, msg: &Message) -> crate::Result<()>;

    async fn close(&mut self) -> crate::Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct HubOptions {
    /// Deadline for one delivery attempt. A connection that misses it is
    /// treated as failed.
    pub send_timeout: Duration,
    /// Capacity of the command queue feeding the hub task.
    pub queue_capacity: usize,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            send_timeout: DEFAULT_SEND_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

enum Command {
    Register {
        id: ConnectionId,
        conn: Registered,
        done: oneshot::Sender<bool>,
    },
    Unregister {
        id: ConnectionId,
        done: oneshot::Sender<bool>,
    },
    Publish(Message),
    Connections(oneshot::Sender<Vec<ConnectionId>>),
}

/// Handle to the hub task. Cheap to clone; the task stops once every handle
/// is dropped.
#[derive(Clone)]
pub struct Hub {
    tx: mpsc::Sender<Command>,
}

impl Hub {
    pub fn spawn(options: HubOptions) -> (Hub, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let task = HubTask {
            rx,
            conns: HashMap::new(),
            send_timeout: options.send_timeout,
        };
        (Hub { tx }, tokio::spawn(task.run()))
    }

    /// Add a connection to the live set. Returns `false` if `id` was already
    /// registered, in which case the given sink is dropped.
    ///
    /// `evicted` is cancelled once the hub lets go of the connection, however
    /// that happens, so the owner of the read half can stop too.
    pub async fn register(
        &self,
        id: ConnectionId,
        sink: Box<dyn FrameSink>,
        evicted: CancellationToken,
    ) -> crate::Result<bool> {
        let (done, rx) = oneshot::channel();
        let conn = Registered { sink, evicted };
        self.send(Command::Register { id, conn, done }).await?;
        rx.await.map_err(|_| RelayError::HubClosed)
    }

    /// Remove and close a connection. Returns `false` if it was not registered.
    pub async fn unregister(&self, id: ConnectionId) -> crate::Result<bool> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Unregister { id, done }).await?;
        rx.await.map_err(|_| RelayError::HubClosed)
    }

    /// Queue `msg` for delivery to every registered connection, the sender
    /// included. Waits only while the hub queue is full.
    pub async fn publish(&self, msg: Message) -> crate::Result<()> {
        self.send(Command::Publish(msg)).await
    }

    /// Snapshot of the live set, taken after every earlier command has been
    /// processed.
    pub async fn connections(&self) -> crate::Result<Vec<ConnectionId>> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Connections(done)).await?;
        rx.await.map_err(|_| RelayError::HubClosed)
    }

    async fn send(&self, cmd: Command) -> crate::Result<()> {
        self.tx.send(cmd).await.map_err(|_| RelayError::HubClosed)
    }
}

struct Registered {
    sink: Box<dyn FrameSink>,
    evicted: CancellationToken,
}

struct HubTask {
    rx: mpsc::Receiver<Command>,
    conns: HashMap<ConnectionId, Registered>,
    send_timeout: Duration,
}

impl HubTask {
    async fn run(mut self) {
        debug!("broadcast hub started");
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                Command::Register { id, conn, done } => {
                    let inserted = !self.conns.contains_key(&id);
                    if inserted {
                        self.conns.insert(id, conn);
                        info!(conn = %id, live = self.conns.len(), "connection registered");
                    }
                    let _ = done.send(inserted);
                }
                Command::Unregister { id, done } => {
                    let removed = self.remove(id).await;
                    let _ = done.send(removed);
                }
                Command::Publish(msg) => self.publish(&msg).await,
                Command::Connections(done) => {
                    let _ = done.send(self.conns.keys().copied().collect());
                }
            }
        }

        for (_, mut conn) in self.conns.drain() {
            conn.evicted.cancel();
            let _ = time::timeout(self.send_timeout, conn.sink.close()).await;
        }
        debug!("broadcast hub stopped");
    }

    async fn publish(&mut self, msg: &Message) {
        trace!(kind = msg.kind(), recipients = self.conns.len(), "fan out");
        let mut failed = Vec::new();
        for (id, conn) in self.conns.iter_mut() {
            let sent = time::timeout(self.send_timeout, conn.sink.send(msg))
                .await
                .unwrap_or_else(|_| Err(RelayError::SendTimeout(self.send_timeout)));
            if let Err(err) = sent {
                warn!(conn = %id, cause = %err, "delivery failed, dropping connection");
                failed.push(*id);
            }
        }
        for id in failed {
            self.remove(id).await;
        }
    }

    async fn remove(&mut self, id: ConnectionId) -> bool {
        match self.conns.remove(&id) {
            Some(mut conn) => {
                conn.evicted.cancel();
                if let Ok(Err(err)) = time::timeout(self.send_timeout, conn.sink.close()).await {
                    debug!(conn = %id, cause = %err, "close failed");
                }
                info!(conn = %id, live = self.conns.len(), "connection removed");
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use super::*;

    struct ChannelSink {
        tx: mpsc::UnboundedSender<Message>,
        failing: Arc<AtomicBool>,
    }

    #[async_trait]
    impl FrameSink for ChannelSink {
        async fn send(&mut self, msg: &Message) -> crate::Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(RelayError::ConnectionClosed);
            }
            self.tx
                .send(msg.clone())
                .map_err(|_| RelayError::ConnectionClosed)
        }

        async fn close(&mut self) -> crate::Result<()> {
            Ok(())
        }
    }

    /// Never completes a send.
    struct StalledSink;

    #[async_trait]
    impl FrameSink for StalledSink {
        async fn send(&mut self, _msg: &Message) -> crate::Result<()> {
            std::future::pending().await
        }

        async fn close(&mut self) -> crate::Result<()> {
            Ok(())
        }
    }

    struct Peer {
        id: ConnectionId,
        rx: mpsc::UnboundedReceiver<Message>,
        failing: Arc<AtomicBool>,
        evicted: CancellationToken,
    }

    async fn connect(hub: &Hub) -> Peer {
        let (tx, rx) = mpsc::unbounded_channel();
        let failing = Arc::new(AtomicBool::new(false));
        let id = ConnectionId::new();
        let sink = ChannelSink {
            tx,
            failing: failing.clone(),
        };
        let evicted = CancellationToken::new();
        assert!(hub
            .register(id, Box::new(sink), evicted.clone())
            .await
            .unwrap());
        Peer {
            id,
            rx,
            failing,
            evicted,
        }
    }

    #[tokio::test]
    async fn publish_reaches_everyone_and_heals_on_failure() {
        let (hub, _task) = Hub::spawn(HubOptions::default());
        let mut a = connect(&hub).await;
        let mut b = connect(&hub).await;
        let mut c = connect(&hub).await;

        let status = Message::new("status", "x");
        hub.publish(status.clone()).await.unwrap();
        // Processed after the publish, so delivery is complete.
        assert_eq!(hub.connections().await.unwrap().len(), 3);
        for peer in [&mut a, &mut b, &mut c] {
            assert_eq!(peer.rx.try_recv().unwrap(), status);
            assert!(peer.rx.try_recv().is_err());
        }

        b.failing.store(true, Ordering::SeqCst);
        let second = Message::new("status", "y");
        hub.publish(second.clone()).await.unwrap();
        let live = hub.connections().await.unwrap();
        assert_eq!(live.len(), 2);
        assert!(!live.contains(&b.id));
        assert!(b.evicted.is_cancelled());
        assert!(!a.evicted.is_cancelled());
        assert_eq!(a.rx.try_recv().unwrap(), second);
        assert_eq!(c.rx.try_recv().unwrap(), second);

        // B recovering its sink does not bring it back.
        b.failing.store(false, Ordering::SeqCst);
        hub.publish(Message::new("status", "z")).await.unwrap();
        hub.connections().await.unwrap();
        assert!(b.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn each_recipient_sees_publish_order() {
        let (hub, _task) = Hub::spawn(HubOptions::default());
        let mut a = connect(&hub).await;
        let mut b = connect(&hub).await;

        for i in 0..5 {
            hub.publish(Message::new("chat", i.to_string())).await.unwrap();
        }
        hub.connections().await.unwrap();
        for peer in [&mut a, &mut b] {
            for i in 0..5 {
                assert_eq!(peer.rx.try_recv().unwrap().payload(), i.to_string());
            }
        }
    }

    #[tokio::test]
    async fn register_and_unregister_are_idempotent() {
        let (hub, _task) = Hub::spawn(HubOptions::default());
        let a = connect(&hub).await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let duplicate = ChannelSink {
            tx,
            failing: Arc::new(AtomicBool::new(false)),
        };
        assert!(!hub
            .register(a.id, Box::new(duplicate), CancellationToken::new())
            .await
            .unwrap());
        assert_eq!(hub.connections().await.unwrap(), vec![a.id]);

        assert!(hub.unregister(a.id).await.unwrap());
        assert!(a.evicted.is_cancelled());
        assert!(!hub.unregister(a.id).await.unwrap());
        assert!(hub.connections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stalled_connection_is_evicted_after_deadline() {
        let options = HubOptions {
            send_timeout: Duration::from_millis(50),
            ..HubOptions::default()
        };
        let (hub, _task) = Hub::spawn(options);
        let mut a = connect(&hub).await;
        let stalled = ConnectionId::new();
        let stalled_evicted = CancellationToken::new();
        hub.register(stalled, Box::new(StalledSink), stalled_evicted.clone())
            .await
            .unwrap();

        hub.publish(Message::new("status", "ping")).await.unwrap();
        let live = time::timeout(Duration::from_secs(2), hub.connections())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(live, vec![a.id]);
        assert!(stalled_evicted.is_cancelled());
        assert_eq!(a.rx.try_recv().unwrap().payload(), "ping");
    }

    #[tokio::test]
    async fn hub_stops_when_handles_are_dropped() {
        let (hub, task) = Hub::spawn(HubOptions::default());
        let a = connect(&hub).await;
        drop(hub);
        time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(a.evicted.is_cancelled());
    }
}
