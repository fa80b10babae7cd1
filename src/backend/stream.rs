//! In-order command stream
//!
//! Commands run on a dedicated thread in submission order. The first error a
//! command returns is kept until the next [`CommandStream::wait`]; commands
//! submitted after a failure are skipped so a broken pipeline does not keep
//! writing into outputs. A panicking command is reported as a logic error.

use super::HostFunc;
use crate::error::{DenoiseError, DenoiseResult};
use crate::logic_error;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, trace};

#[derive(Default)]
struct StreamState {
    pending: usize,
    error: Option<DenoiseError>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<StreamState>,
    idle: Condvar,
}

/// Single-consumer queue of host functions
pub struct CommandStream {
    name: String,
    sender: Mutex<Option<Sender<HostFunc>>>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl std::fmt::Debug for CommandStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandStream")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish()
    }
}

impl CommandStream {
    /// Spawn the stream thread
    pub fn new(name: &str) -> DenoiseResult<Self> {
        let (sender, receiver) = mpsc::channel::<HostFunc>();
        let shared = Arc::new(Shared::default());
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(receiver, worker_shared))?;
        let worker_id = worker.thread().id();

        debug!("started command stream '{}'", name);

        Ok(Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            shared,
            worker: Some(worker),
            worker_id,
        })
    }

    /// Enqueue a command
    pub fn submit(&self, func: HostFunc) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.pending += 1;
        }

        let sent = match self.sender.lock() {
            Ok(sender) => match sender.as_ref() {
                Some(sender) => sender.send(func).is_ok(),
                None => false,
            },
            Err(_) => false,
        };

        if !sent {
            if let Ok(mut state) = self.shared.state.lock() {
                state.pending -= 1;
                state
                    .error
                    .get_or_insert_with(|| logic_error!("command stream '{}' is closed", self.name));
            }
            self.shared.idle.notify_all();
        }
    }

    /// Block until every submitted command has run
    ///
    /// Returns the first error raised since the previous wait and clears it.
    pub fn wait(&self) -> DenoiseResult<()> {
        if thread::current().id() == self.worker_id {
            return Err(logic_error!(
                "command stream '{}' cannot be waited on from its own thread",
                self.name
            ));
        }
        let mut state = self.shared.state.lock()?;
        while state.pending > 0 {
            state = self.shared.idle.wait(state)?;
        }
        match state.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Commands submitted but not yet finished
    pub fn pending(&self) -> usize {
        self.shared.state.lock().map(|s| s.pending).unwrap_or(0)
    }

    /// Whether the caller is running on the stream thread
    pub fn is_current_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }
}

fn run(receiver: Receiver<HostFunc>, shared: Arc<Shared>) {
    for func in receiver {
        let skip = shared
            .state
            .lock()
            .map(|s| s.error.is_some())
            .unwrap_or(true);

        let result = if skip {
            trace!("skipping command after earlier failure");
            Ok(())
        } else {
            match panic::catch_unwind(AssertUnwindSafe(func)) {
                Ok(result) => result,
                Err(payload) => Err(panic_error(payload)),
            }
        };

        if let Ok(mut state) = shared.state.lock() {
            if let Err(err) = result {
                debug!("command failed: {}", err);
                state.error.get_or_insert(err);
            }
            state.pending -= 1;
        }
        shared.idle.notify_all();
    }
}

fn panic_error(payload: Box<dyn std::any::Any + Send>) -> DenoiseError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    logic_error!("command panicked: {}", message)
}

impl Drop for CommandStream {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        if let Some(worker) = self.worker.take() {
            // The last engine reference can be released by a command running
            // on the worker itself; joining there would deadlock.
            if thread::current().id() != self.worker_id {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_commands_run_in_order() {
        let stream = CommandStream::new("test-order").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            stream.submit(Box::new(move || -> DenoiseResult<()> {
                log.lock()?.push(i);
                Ok(())
            }));
        }
        stream.wait().unwrap();
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
        assert_eq!(stream.pending(), 0);
    }

    #[test]
    fn test_first_error_wins_and_clears() {
        let stream = CommandStream::new("test-error").unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        stream.submit(Box::new(|| -> DenoiseResult<()> { Err(DenoiseError::Cancelled) }));
        let counter = Arc::clone(&ran);
        stream.submit(Box::new(move || -> DenoiseResult<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(logic_error!("second"))
        }));

        assert!(matches!(stream.wait(), Err(DenoiseError::Cancelled)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(stream.wait().is_ok());

        let counter = Arc::clone(&ran);
        stream.submit(Box::new(move || -> DenoiseResult<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        stream.wait().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_becomes_logic_error() {
        let stream = CommandStream::new("test-panic").unwrap();
        stream.submit(Box::new(|| -> DenoiseResult<()> { panic!("kernel exploded") }));
        let err = stream.wait().unwrap_err();
        assert!(matches!(err, DenoiseError::Logic(_)));
        assert!(err.to_string().contains("kernel exploded"));
    }
}
