//! Single-actor SSE broker: fans published events out to subscriber
//! channels, never blocking the executor that publishes into it.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use wave_core::Event;

const SUBSCRIBER_BUFFER: usize = 64;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// What a subscriber receives: either a real event or a heartbeat keeping
/// the connection alive.
#[derive(Debug, Clone)]
pub enum BrokerMessage {
    Event(Event),
    Heartbeat,
}

enum Command {
    Subscribe {
        run_id: String,
        reply: oneshot::Sender<(u64, mpsc::Receiver<BrokerMessage>)>,
    },
    Unsubscribe {
        run_id: String,
        subscriber_id: u64,
    },
    Publish {
        event: Event,
    },
}

#[derive(Clone)]
pub struct BrokerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl BrokerHandle {
    /// Fan out `event` to every subscriber of its run. Never blocks: a full
    /// subscriber channel just drops the event for that subscriber.
    pub fn publish(&self, event: Event) {
        let _ = self.commands.send(Command::Publish { event });
    }

    /// Subscribe to a run's event stream, returning a subscriber id (for
    /// `unsubscribe`) alongside the receiver.
    pub async fn subscribe(&self, run_id: impl Into<String>) -> (u64, mpsc::Receiver<BrokerMessage>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.commands.send(Command::Subscribe {
            run_id: run_id.into(),
            reply: reply_tx,
        });
        reply_rx.await.expect("broker actor dropped without replying")
    }

    /// Explicitly remove a subscriber, e.g. when an SSE client disconnects.
    /// Not required for correctness (a closed channel is pruned lazily on
    /// the next publish or heartbeat tick) but avoids holding a dead
    /// subscriber entry until then.
    pub fn unsubscribe(&self, run_id: impl Into<String>, subscriber_id: u64) {
        let _ = self.commands.send(Command::Unsubscribe {
            run_id: run_id.into(),
            subscriber_id,
        });
    }
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<BrokerMessage>,
}

/// Runs the broker actor until `cancel` fires, at which point every
/// subscriber channel is closed by dropping its sender.
async fn run(mut commands_rx: mpsc::UnboundedReceiver<Command>, cancel: CancellationToken) {
    let mut subscribers: HashMap<String, Vec<Subscriber>> = HashMap::new();
    let mut next_id: u64 = 0;
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                subscribers.clear();
                return;
            }
            _ = heartbeat.tick() => {
                for subs in subscribers.values_mut() {
                    subs.retain(|s| s.sender.try_send(BrokerMessage::Heartbeat).is_ok());
                }
            }
            command = commands_rx.recv() => {
                let Some(command) = command else { return };
                match command {
                    Command::Subscribe { run_id, reply } => {
                        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
                        let id = next_id;
                        next_id += 1;
                        subscribers.entry(run_id).or_default().push(Subscriber { id, sender: tx });
                        let _ = reply.send((id, rx));
                    }
                    Command::Unsubscribe { run_id, subscriber_id } => {
                        if let Some(subs) = subscribers.get_mut(&run_id) {
                            subs.retain(|s| s.id != subscriber_id);
                        }
                    }
                    Command::Publish { event } => {
                        if let Some(subs) = subscribers.get_mut(&event.run_id) {
                            subs.retain(|s| match s.sender.try_send(BrokerMessage::Event(event.clone())) {
                                Ok(()) => true,
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    warn!(run_id = %event.run_id, subscriber = s.id, "dropping event for slow subscriber");
                                    true
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => false,
                            });
                        }
                    }
                }
            }
        }
    }
}

/// Spawn the broker actor, returning a handle callers clone freely.
pub fn spawn(cancel: CancellationToken) -> BrokerHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    tokio::spawn(run(commands_rx, cancel));
    BrokerHandle { commands: commands_tx }
}
