// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, warn};

use super::config::WorkerPoolConfig;
use super::{AppError, AppResult, Shutdown};

pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Background workers shared by extensions through `PluginContext::submit`.
///
/// Tasks go through one bounded channel that every worker pulls from. A monitor checks
/// the workers periodically and respawns any that died from a panicking task.
#[derive(Clone)]
pub struct TaskPool {
    task_tx: async_channel::Sender<Task>,
    worker_count: usize,
}

struct Worker {
    id: usize,
    handle: Option<JoinHandle<()>>,
}

impl TaskPool {
    pub fn new(
        config: &WorkerPoolConfig,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Self {
        let worker_count = config.worker_count();
        let (task_tx, task_rx) = async_channel::bounded(config.channel_capacity);

        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            workers.push(spawn_worker(
                id,
                task_rx.clone(),
                Shutdown::new(notify_shutdown.subscribe()),
                shutdown_complete_tx.clone(),
            ));
        }

        let monitor_interval = Duration::from_secs(config.monitor_interval_secs.max(1));
        let check_timeout = Duration::from_millis(config.worker_check_timeout_ms);
        // subscribed here so a shutdown sent before the monitor is first polled still reaches it
        let shutdown = Shutdown::new(notify_shutdown.subscribe());
        tokio::spawn(monitor(
            workers,
            task_rx,
            shutdown,
            notify_shutdown,
            shutdown_complete_tx,
            monitor_interval,
            check_timeout,
        ));

        TaskPool {
            task_tx,
            worker_count,
        }
    }

    /// Queue a task without waiting. Fails when the queue is full or the pool is gone.
    pub fn submit<F>(&self, task: F) -> AppResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.task_tx
            .try_send(Box::pin(task))
            .map_err(|e| AppError::ChannelSendError(format!("task pool: {}", e)))
    }

    /// Queue a task, waiting for room in the channel.
    pub async fn send<F>(&self, task: F) -> AppResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.task_tx
            .send(Box::pin(task))
            .await
            .map_err(|_| AppError::ChannelSendError("task pool closed".to_string()))
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn pending(&self) -> usize {
        self.task_tx.len()
    }
}

fn spawn_worker(
    id: usize,
    task_rx: async_channel::Receiver<Task>,
    mut shutdown: Shutdown,
    shutdown_complete_tx: mpsc::Sender<()>,
) -> Worker {
    let handle = tokio::spawn(async move {
        debug!("task worker {} started", id);
        loop {
            tokio::select! {
                task = task_rx.recv() => {
                    match task {
                        Ok(task) => task.await,
                        Err(_) => break,
                    }
                }
                _ = shutdown.recv() => {
                    debug!("task worker {} shutting down", id);
                    break;
                }
            }
        }
        drop(shutdown_complete_tx);
    });
    Worker {
        id,
        handle: Some(handle),
    }
}

async fn monitor(
    mut workers: Vec<Worker>,
    task_rx: async_channel::Receiver<Task>,
    mut shutdown: Shutdown,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    interval: Duration,
    check_timeout: Duration,
) {
    let mut ticker = time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!("task pool monitor received shutdown signal");
                break;
            }
            _ = ticker.tick() => {
                for worker in workers.iter_mut() {
                    let finished = worker.handle.as_ref().is_some_and(|h| h.is_finished());
                    if !finished {
                        continue;
                    }
                    let Some(handle) = worker.handle.take() else {
                        continue;
                    };
                    match time::timeout(check_timeout, handle).await {
                        Ok(Err(join_error)) if join_error.is_panic() => {
                            let payload = join_error.into_panic();
                            error!(
                                "task worker {} panicked: {}",
                                worker.id,
                                panic_message(payload.as_ref())
                            );
                            warn!("restarting task worker {}", worker.id);
                            *worker = spawn_worker(
                                worker.id,
                                task_rx.clone(),
                                Shutdown::new(notify_shutdown.subscribe()),
                                shutdown_complete_tx.clone(),
                            );
                        }
                        // exited normally or was cancelled, nothing to restart
                        _ => {}
                    }
                }
            }
        }
    }
    debug!("task pool monitor exiting");
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn pool_config(num_workers: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            num_workers,
            channel_capacity: 16,
            monitor_interval_secs: 1,
            worker_check_timeout_ms: 50,
        }
    }

    #[tokio::test]
    async fn submitted_tasks_run() {
        let (notify, _) = broadcast::channel(1);
        let (complete_tx, _complete_rx) = mpsc::channel(1);
        let pool = TaskPool::new(&pool_config(2), notify.clone(), complete_tx);
        assert_eq!(pool.worker_count(), 2);

        let counter = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::channel(4);
        for _ in 0..4 {
            let counter = counter.clone();
            let done_tx = done_tx.clone();
            pool.submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = done_tx.send(()).await;
            })
            .unwrap();
        }
        for _ in 0..4 {
            done_rx.recv().await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        let _ = notify.send(());
    }

    #[tokio::test]
    async fn workers_release_completion_channel_on_shutdown() {
        let (notify, _) = broadcast::channel(1);
        let (complete_tx, mut complete_rx) = mpsc::channel::<()>(1);
        let _pool = TaskPool::new(&pool_config(3), notify.clone(), complete_tx);
        // sent before any spawned task has been polled
        let _ = notify.send(());
        // every clone of the sender is dropped once workers and monitor exit
        let closed = time::timeout(Duration::from_secs(5), complete_rx.recv()).await;
        assert!(matches!(closed, Ok(None)));
    }

    #[test]
    fn panic_payloads_are_readable() {
        let text: Box<dyn Any + Send> = Box::new("boom");
        let owned: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(text.as_ref()), "boom");
        assert_eq!(panic_message(owned.as_ref()), "bang");
    }
}
