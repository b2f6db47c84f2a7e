use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Result};

use super::Device;

/// Unit of work enqueued on a stream.
pub type StreamJob = Box<dyn FnOnce() + Send + 'static>;

/// One-shot completion flag recorded by a stream and awaited by others.
#[derive(Debug, Clone, Default)]
pub struct StreamEvent {
    inner: Arc<EventInner>,
}

#[derive(Debug, Default)]
struct EventInner {
    recorded: Mutex<bool>,
    cv: Condvar,
}

impl StreamEvent {
    pub fn new() -> Self {
        Self::default()
    }

    fn signal(&self) {
        let mut recorded = self
            .inner
            .recorded
            .lock()
            .expect("stream event mutex poisoned");
        *recorded = true;
        self.inner.cv.notify_all();
    }

    /// Block the calling thread until the event is recorded.
    pub fn wait(&self) {
        let mut recorded = self
            .inner
            .recorded
            .lock()
            .expect("stream event mutex poisoned");
        while !*recorded {
            recorded = self
                .inner
                .cv
                .wait(recorded)
                .expect("stream event mutex poisoned");
        }
    }

    pub fn is_recorded(&self) -> bool {
        *self
            .inner
            .recorded
            .lock()
            .expect("stream event mutex poisoned")
    }
}

enum StreamCommand {
    Launch(StreamJob),
    Wait(StreamEvent),
    Record(StreamEvent),
    Shutdown,
}

/// In-order command queue drained by a dedicated worker thread.
pub struct DeviceStream {
    index: usize,
    device: Device,
    tx: mpsc::Sender<StreamCommand>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceStream {
    pub fn new(index: usize, device: Device) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(format!("partialrun-stream-{}", index))
            .spawn(move || worker_loop(rx))
            .map_err(|err| anyhow!("failed to spawn stream {} worker: {}", index, err))?;
        Ok(Self {
            index,
            device,
            tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn device(&self) -> Device {
        self.device
    }

    fn send(&self, command: StreamCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| anyhow!("stream {} worker exited", self.index))
    }

    /// Enqueue a job; returns without waiting for it to run.
    pub fn launch(&self, job: StreamJob) -> Result<()> {
        self.send(StreamCommand::Launch(job))
    }

    /// Hold later commands on this stream until `event` is recorded.
    pub fn wait_event(&self, event: &StreamEvent) -> Result<()> {
        self.send(StreamCommand::Wait(event.clone()))
    }

    /// Record `event` once every earlier command has finished.
    pub fn record_event(&self, event: &StreamEvent) -> Result<()> {
        self.send(StreamCommand::Record(event.clone()))
    }

    /// Block the host until everything enqueued so far has run.
    pub fn synchronize(&self) -> Result<()> {
        let event = StreamEvent::new();
        self.record_event(&event)?;
        event.wait();
        Ok(())
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        let _ = self.tx.send(StreamCommand::Shutdown);
        let handle = self
            .handle
            .lock()
            .expect("stream handle mutex poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn worker_loop(rx: mpsc::Receiver<StreamCommand>) {
    while let Ok(command) = rx.recv() {
        match command {
            StreamCommand::Launch(job) => {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    crate::critical!("stream job panicked outside kernel guard");
                }
            }
            StreamCommand::Wait(event) => event.wait(),
            StreamCommand::Record(event) => event.signal(),
            StreamCommand::Shutdown => break,
        }
    }
}

/// Fixed set of streams shared by every execution state of a session.
pub struct DeviceStreamCollection {
    streams: Vec<DeviceStream>,
}

impl DeviceStreamCollection {
    pub fn new(devices: &[Device]) -> Result<Self> {
        if devices.is_empty() {
            return Err(anyhow!("at least one stream is required"));
        }
        let streams = devices
            .iter()
            .enumerate()
            .map(|(index, device)| DeviceStream::new(index, *device))
            .collect::<Result<Vec<_>>>()?;
        crate::trace!("streams.create count={}", streams.len());
        Ok(Self { streams })
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn stream(&self, index: usize) -> Option<&DeviceStream> {
        self.streams.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceStream> {
        self.streams.iter()
    }

    /// Drain every stream, recording all markers before waiting on any.
    pub fn synchronize_all(&self) -> Result<()> {
        let events = self
            .streams
            .iter()
            .map(|stream| {
                let event = StreamEvent::new();
                stream.record_event(&event).map(|_| event)
            })
            .collect::<Result<Vec<_>>>()?;
        for event in events {
            event.wait();
        }
        Ok(())
    }
}
