use std::sync::Mutex;

use netconn_common::{Batch, BATCH_SIZE};
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task::JoinHandle,
    time::{self, Duration, Instant, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::{batch::BatchManager, connection::ConnectionStats, maps::KernelMap};

/// Receives every batch of newly observed closed connections.
pub type ClosedConnHandler = Box<dyn FnMut(&[ConnectionStats]) + Send>;

#[derive(Debug)]
pub enum Message {
    Batch { cpu: u32, batch: Batch },
    // acked once the pending pull was delivered
    Flush(oneshot::Sender<()>),
}

enum State<B> {
    Idle {
        manager: BatchManager<B>,
        rx: UnboundedReceiver<Message>,
    },
    Running {
        shutdown: oneshot::Sender<()>,
        handle: JoinHandle<()>,
    },
    Stopped,
}

pub struct CloseConsumer<B> {
    tx: UnboundedSender<Message>,
    state: Mutex<State<B>>,
    pending_interval: Duration,
}

impl<B> CloseConsumer<B>
where
    B: KernelMap<u32, Batch> + Send + 'static,
{
    pub fn new(manager: BatchManager<B>, pending_interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        CloseConsumer {
            tx,
            state: Mutex::new(State::Idle { manager, rx }),
            pending_interval,
        }
    }

    pub fn sender(&self) -> UnboundedSender<Message> {
        self.tx.clone()
    }

    pub fn start(&self, handler: ClosedConnHandler) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (manager, rx) = match std::mem::replace(&mut *state, State::Stopped) {
            State::Idle { manager, rx } => (manager, rx),
            other => {
                *state = other;
                return;
            }
        };

        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run(
            manager,
            rx,
            shutdown_rx,
            self.pending_interval,
            handler,
        ));
        *state = State::Running { shutdown, handle };
    }

    /// No-op unless the consumer is running.
    pub async fn flush_pending(&self) {
        if !self.is_running() {
            return;
        }
        let (done, wait) = oneshot::channel();
        if self.tx.send(Message::Flush(done)).is_err() {
            return;
        }
        // dropped unanswered if the consumer stops first
        let _ = wait.await;
    }

    fn is_running(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        matches!(*state, State::Running { .. })
    }

    pub async fn stop(&self) {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *state, State::Stopped)
        };

        if let State::Running { shutdown, handle } = previous {
            let _ = shutdown.send(());
            if let Err(e) = handle.await {
                debug!("closed connection consumer ended abnormally: {}", e);
            }
        }
    }
}

async fn run<B: KernelMap<u32, Batch>>(
    mut manager: BatchManager<B>,
    mut rx: UnboundedReceiver<Message>,
    mut shutdown: oneshot::Receiver<()>,
    pending_interval: Duration,
    mut handler: ClosedConnHandler,
) {
    info!(
        "consuming closed connections from {} cpus",
        manager.num_cpus()
    );
    let mut ticker = time::interval(pending_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut buffer = Vec::with_capacity(BATCH_SIZE * manager.num_cpus());

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            // ahead of rx so a busy perf stream cannot starve the pull
            _ = ticker.tick() => {
                manager.pending_conns(Instant::now(), &mut buffer);
                deliver(&mut handler, &mut buffer);
            }
            msg = rx.recv() => match msg {
                Some(Message::Batch { cpu, batch }) => {
                    manager.drain_full(cpu as usize, &batch, &mut buffer);
                    deliver(&mut handler, &mut buffer);
                }
                Some(Message::Flush(done)) => {
                    manager.pending_conns(Instant::now(), &mut buffer);
                    deliver(&mut handler, &mut buffer);
                    let _ = done.send(());
                }
                None => break,
            },
        }
    }

    debug!("closed connection consumer stopped");
}

fn deliver(handler: &mut ClosedConnHandler, buffer: &mut Vec<ConnectionStats>) {
    if buffer.is_empty() {
        return;
    }
    handler(buffer);
    buffer.clear();
}
