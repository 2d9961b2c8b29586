//! Scripted in-process workers for driving the coordinator.

use fanout::{LaunchError, Launched, WorkerLauncher};
use fanout_common::{Message, PASS, Role, Transport, TransportError, WorkerSpec};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type OutputFn = dyn Fn(&str, u32) -> String + Send + Sync;

/// How a fake worker answers.
#[derive(Clone)]
pub struct Behavior {
    /// Output for a job on its n-th attempt (starting at 1).
    pub output: Arc<OutputFn>,
    /// Time each job takes.
    pub delay: Duration,
    /// Drop the connection instead of answering the n-th job (starting at 1).
    pub drop_on: Option<usize>,
    /// Fail to boot.
    pub boot_fails: bool,
    /// Boot, then hang up after this long without ever reporting ready.
    pub vanish_before_ready: Option<Duration>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            output: Arc::new(|_, _| PASS.to_string()),
            delay: Duration::from_millis(5),
            drop_on: None,
            boot_fails: false,
            vanish_before_ready: None,
        }
    }
}

impl Behavior {
    pub fn with_output(mut self, output: impl Fn(&str, u32) -> String + Send + Sync + 'static) -> Self {
        self.output = Arc::new(output);
        self
    }

    pub fn dropping_on(mut self, job: usize) -> Self {
        self.drop_on = Some(job);
        self
    }

    pub fn failing_boot(mut self) -> Self {
        self.boot_fails = true;
        self
    }

    pub fn vanishing_before_ready(mut self, after: Duration) -> Self {
        self.vanish_before_ready = Some(after);
        self
    }
}

/// What the fake workers observed.
#[derive(Debug, Default)]
pub struct Stats {
    /// Every `RunJob`, in arrival order.
    pub dispatched: Vec<String>,
    pub attempts: HashMap<String, u32>,
    pub outstanding: usize,
    pub peak_outstanding: usize,
    /// Per worker index, the most jobs it held at once.
    pub peak_per_worker: HashMap<usize, usize>,
    pub shutdowns: usize,
    /// `RunJob`s that arrived after a worker dropped.
    pub after_drop: usize,
    pub dropped: bool,
}

/// Launches [`Behavior`]-driven workers over in-memory transports.
#[derive(Clone, Default)]
pub struct FakeLauncher {
    behaviors: HashMap<usize, Behavior>,
    default: Behavior,
    pub stats: Arc<Mutex<Stats>>,
}

impl FakeLauncher {
    pub fn new(default: Behavior) -> Self {
        Self {
            default,
            ..Self::default()
        }
    }

    pub fn with_worker(mut self, index: usize, behavior: Behavior) -> Self {
        self.behaviors.insert(index, behavior);
        self
    }

    pub fn stats(&self) -> std::sync::MutexGuard<'_, Stats> {
        self.stats.lock().unwrap()
    }
}

impl WorkerLauncher for FakeLauncher {
    async fn launch(&self, spec: &WorkerSpec, index: usize) -> Result<Launched, LaunchError> {
        let behavior = self.behaviors.get(&index).unwrap_or(&self.default).clone();
        if behavior.boot_fails {
            return Err(LaunchError::Transport(TransportError::Closed(spec.label(index))));
        }
        let (master, worker) = Transport::pair(Role::Master, Role::Worker, spec.label(index));
        tokio::spawn(serve(
            worker,
            index,
            spec.slots as usize,
            behavior,
            self.stats.clone(),
        ));
        Ok(Launched {
            transport: master,
            child: None,
        })
    }
}

async fn serve(worker: Transport, index: usize, slots: usize, behavior: Behavior, stats: Arc<Mutex<Stats>>) {
    if let Some(after) = behavior.vanish_before_ready {
        tokio::time::sleep(after).await;
        let _ = worker.close().await;
        return;
    }

    let worker = Arc::new(worker);
    let _ = worker.send(Message::WorkerReady).await;
    for _ in 0..slots {
        let _ = worker.send(Message::RequestJob).await;
    }

    let mut held = 0usize;
    let mut received = 0usize;
    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    loop {
        tokio::select! {
            biased;
            Some(()) = done_rx.recv() => held -= 1,
            envelope = worker.receive() => {
                let Some(envelope) = envelope else { break };
                match envelope.message {
                    Message::RunJob { job } => {
                        received += 1;
                        held += 1;
                        let attempt = {
                            let mut stats = stats.lock().unwrap();
                            if stats.dropped {
                                stats.after_drop += 1;
                            }
                            stats.dispatched.push(job.clone());
                            let attempt = stats.attempts.entry(job.clone()).or_insert(0);
                            *attempt += 1;
                            let attempt = *attempt;
                            stats.outstanding += 1;
                            stats.peak_outstanding = stats.peak_outstanding.max(stats.outstanding);
                            let peak = stats.peak_per_worker.entry(index).or_insert(0);
                            *peak = (*peak).max(held);
                            attempt
                        };

                        if behavior.drop_on == Some(received) {
                            {
                                let mut stats = stats.lock().unwrap();
                                stats.dropped = true;
                                stats.outstanding -= 1;
                            }
                            let _ = worker.close().await;
                            break;
                        }

                        let worker = worker.clone();
                        let stats = stats.clone();
                        let behavior = behavior.clone();
                        let done = done_tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(behavior.delay).await;
                            let output = (behavior.output)(&job, attempt);
                            stats.lock().unwrap().outstanding -= 1;
                            let _ = done.send(());
                            let _ = worker.send(Message::Result { job, output }).await;
                        });
                    }
                    Message::Shutdown => {
                        stats.lock().unwrap().shutdowns += 1;
                        let _ = worker.close().await;
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}
