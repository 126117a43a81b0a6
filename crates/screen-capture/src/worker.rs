// Single background worker
//
// Jobs run strictly in submission order on one named thread. Between jobs the
// worker calls `on_tick` every `tick_every`, which the session uses to watch a
// running encoder.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use flume::{RecvTimeoutError, Sender};
use log::{debug, warn};

use crate::CaptureError;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Shutdown,
}

pub(crate) struct Worker {
    tx: Sender<Message>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn<F>(name: &str, tick_every: Duration, mut on_tick: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (tx, rx) = flume::unbounded::<Message>();
        let thread_name = name.to_string();

        let thread = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                debug!("🧵 Worker {} started", thread_name);
                let mut next_tick = Instant::now() + tick_every;
                loop {
                    match rx.recv_deadline(next_tick) {
                        Ok(Message::Run(job)) => job(),
                        Ok(Message::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            on_tick();
                            next_tick = Instant::now() + tick_every;
                        }
                    }
                }
                debug!("🧵 Worker {} exited", thread_name);
            })?;

        Ok(Self {
            tx,
            thread: Some(thread),
        })
    }

    pub(crate) fn submit<F>(&self, job: F) -> Result<(), CaptureError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .send(Message::Run(Box::new(job)))
            .map_err(|_| CaptureError::WorkerUnavailable)
    }

    /// Finish queued jobs, then stop the thread and wait for it.
    pub(crate) fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.tx.send(Message::Shutdown);
        if thread.thread().id() == std::thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            warn!("⚠️  Capture worker panicked");
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
