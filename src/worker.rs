//! Command worker: a FIFO mailbox drained by one named OS thread.
//!
//! Submitters append a command and post one token to a counting wake signal;
//! the worker blocks on the signal, takes exactly one command and runs the
//! handler on it. Two lanes are kept: commands on the high lane are always
//! taken before anything on the normal lane. Exit travels on the high lane,
//! so whatever is still queued behind it is handed to
//! [`CommandHandler::discard`] instead of being run.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, trace};

use crate::utils::lock;
use crate::{Error, Result};

/// Per-command logic run on the worker thread.
pub trait CommandHandler<C>: Send + 'static {
    fn handle(&mut self, cmd: C);

    /// Called for commands still queued when the worker exits.
    fn discard(&mut self, cmd: C) {
        drop(cmd);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    High,
    Normal,
}

enum Envelope<C> {
    Run(C),
    Exit,
}

struct Lanes<C> {
    high: VecDeque<Envelope<C>>,
    normal: VecDeque<Envelope<C>>,
    closed: bool,
}

struct Mailbox<C> {
    name: &'static str,
    lanes: Mutex<Lanes<C>>,
    wake: flume::Sender<()>,
}

impl<C> Mailbox<C> {
    fn post(&self, lane: Lane, env: Envelope<C>) -> Result<()> {
        let mut lanes = lock(&self.lanes);
        if lanes.closed {
            return Err(Error::WorkerStopped(self.name));
        }
        match lane {
            Lane::High => lanes.high.push_back(env),
            Lane::Normal => lanes.normal.push_back(env),
        }
        // the receiver lives until the mailbox is closed, so this only
        // fails if the worker thread died
        self.wake
            .send(())
            .map_err(|_| Error::WorkerStopped(self.name))
    }

    fn take(&self) -> Option<Envelope<C>> {
        let mut lanes = lock(&self.lanes);
        lanes.high.pop_front().or_else(|| lanes.normal.pop_front())
    }

    /// Refuse further submissions and hand back whatever is still queued.
    fn close(&self) -> Vec<C> {
        let mut lanes = lock(&self.lanes);
        lanes.closed = true;
        let Lanes { high, normal, .. } = &mut *lanes;
        high.drain(..)
            .chain(normal.drain(..))
            .filter_map(|env| match env {
                Envelope::Run(cmd) => Some(cmd),
                Envelope::Exit => None,
            })
            .collect()
    }
}

/// Cloneable submit side of a [`CommandWorker`].
pub struct WorkerHandle<C> {
    mailbox: Arc<Mailbox<C>>,
}

impl<C> Clone for WorkerHandle<C> {
    fn clone(&self) -> Self {
        Self {
            mailbox: self.mailbox.clone(),
        }
    }
}

impl<C: Send + 'static> WorkerHandle<C> {
    /// Queue a command on the normal lane.
    pub fn submit(&self, cmd: C) -> Result<()> {
        self.submit_to(Lane::Normal, cmd)
    }

    pub fn submit_to(&self, lane: Lane, cmd: C) -> Result<()> {
        self.mailbox.post(lane, Envelope::Run(cmd))
    }

    pub fn name(&self) -> &'static str {
        self.mailbox.name
    }
}

/// Owner of the worker thread. Dropping it stops the worker and joins it.
pub struct CommandWorker<C: Send + 'static> {
    handle: WorkerHandle<C>,
    thread: Option<JoinHandle<()>>,
}

impl<C: Send + 'static> CommandWorker<C> {
    pub fn spawn<H: CommandHandler<C>>(name: &'static str, mut handler: H) -> Result<Self> {
        let (wake_tx, wake_rx) = flume::unbounded();
        let mailbox = Arc::new(Mailbox {
            name,
            lanes: Mutex::new(Lanes {
                high: VecDeque::new(),
                normal: VecDeque::new(),
                closed: false,
            }),
            wake: wake_tx,
        });

        let worker_box = mailbox.clone();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!(worker = name, "command worker started");
                while wake_rx.recv().is_ok() {
                    match worker_box.take() {
                        Some(Envelope::Run(cmd)) => handler.handle(cmd),
                        Some(Envelope::Exit) => break,
                        None => trace!(worker = name, "spurious wake"),
                    }
                }
                let leftover = worker_box.close();
                if !leftover.is_empty() {
                    debug!(worker = name, count = leftover.len(), "discarding queued commands");
                }
                for cmd in leftover {
                    handler.discard(cmd);
                }
                debug!(worker = name, "command worker exited");
            })
            .map_err(|e| {
                error!(worker = name, "failed to spawn worker thread: {e}");
                Error::WorkerStopped(name)
            })?;

        Ok(Self {
            handle: WorkerHandle { mailbox },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> WorkerHandle<C> {
        self.handle.clone()
    }

    pub fn submit(&self, cmd: C) -> Result<()> {
        self.handle.submit(cmd)
    }

    pub fn submit_to(&self, lane: Lane, cmd: C) -> Result<()> {
        self.handle.submit_to(lane, cmd)
    }

    /// Post exit ahead of any queued normal-lane work and wait for the thread.
    /// Returns once no handler call can run any more.
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        if self.handle.mailbox.post(Lane::High, Envelope::Exit).is_err() {
            debug!(worker = self.handle.name(), "worker already closed");
        }
        if thread.join().is_err() {
            error!(worker = self.handle.name(), "worker thread panicked");
        }
    }
}

impl<C: Send + 'static> Drop for CommandWorker<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
