//! Accelerator session: one device, at most one allocated graph.
//!
//! Lifecycle is `open → load_graph → infer* → close`. Before `open` there is
//! no session value at all, which is the uninitialized state. Calling
//! `infer` outside the `GraphAllocated` state is a programming error and is
//! reported as a lifecycle error, never as an empty embedding.

use crate::types::Embedding;
use ndarray::ArrayView4;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AcceleratorError {
    #[error("no compatible accelerator device found ({0})")]
    DeviceUnavailable(String),
    #[error("graph load failed: {0}")]
    GraphLoad(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("no graph allocated on this session")]
    NotAllocated,
    #[error("a graph is already allocated on this session")]
    AlreadyAllocated,
    #[error("accelerator session is closed")]
    SessionClosed,
}

impl AcceleratorError {
    /// True for state-machine violations (caller bugs), false for device faults.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::NotAllocated | Self::AlreadyAllocated | Self::SessionClosed
        )
    }
}

/// A physical inference device.
pub trait Device: Send {
    fn name(&self) -> &str;

    /// Compile and allocate a graph on this device.
    fn allocate(&mut self, graph: &[u8]) -> Result<Box<dyn Graph>, AcceleratorError>;

    /// Release the device handle. Called once, after the graph is dropped.
    fn close(&mut self) {}
}

/// A graph allocated on a [`Device`]. Dropping it deallocates it.
pub trait Graph: Send {
    fn infer(&mut self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>, AcceleratorError>;
}

/// Observable lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opened,
    GraphAllocated,
    Closed,
}

enum State {
    Opened {
        device: Box<dyn Device>,
    },
    GraphAllocated {
        device: Box<dyn Device>,
        graph: Box<dyn Graph>,
        version: String,
    },
    Closed,
}

/// Owns exactly one device and at most one allocated graph.
pub struct AcceleratorSession {
    device_name: String,
    state: State,
}

impl AcceleratorSession {
    /// Open the first enumerated device. Additional devices are ignored.
    pub fn open(devices: Vec<Box<dyn Device>>) -> Result<Self, AcceleratorError> {
        let total = devices.len();
        let device = devices
            .into_iter()
            .next()
            .ok_or_else(|| AcceleratorError::DeviceUnavailable("0 devices enumerated".into()))?;
        let device_name = device.name().to_string();

        tracing::info!(device = %device_name, enumerated = total, "accelerator device opened");

        Ok(Self {
            device_name,
            state: State::Opened { device },
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn state(&self) -> SessionState {
        match self.state {
            State::Opened { .. } => SessionState::Opened,
            State::GraphAllocated { .. } => SessionState::GraphAllocated,
            State::Closed => SessionState::Closed,
        }
    }

    /// Fingerprint of the allocated graph, if any.
    pub fn model_version(&self) -> Option<&str> {
        match &self.state {
            State::GraphAllocated { version, .. } => Some(version),
            _ => None,
        }
    }

    /// Read a graph file from disk and allocate it.
    pub fn load_graph_file(&mut self, path: &Path) -> Result<String, AcceleratorError> {
        let bytes = std::fs::read(path)
            .map_err(|e| AcceleratorError::GraphLoad(format!("{}: {e}", path.display())))?;
        self.load_graph(&bytes)
    }

    /// Allocate `bytes` as this session's graph and return its fingerprint.
    pub fn load_graph(&mut self, bytes: &[u8]) -> Result<String, AcceleratorError> {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Opened { mut device } => match device.allocate(bytes) {
                Ok(graph) => {
                    let version = graph_fingerprint(bytes);
                    tracing::info!(
                        device = %self.device_name,
                        version = %version,
                        size = bytes.len(),
                        "graph allocated"
                    );
                    self.state = State::GraphAllocated {
                        device,
                        graph,
                        version: version.clone(),
                    };
                    Ok(version)
                }
                Err(e) => {
                    self.state = State::Opened { device };
                    Err(e)
                }
            },
            allocated @ State::GraphAllocated { .. } => {
                self.state = allocated;
                Err(AcceleratorError::AlreadyAllocated)
            }
            State::Closed => Err(AcceleratorError::SessionClosed),
        }
    }

    /// Run one inference. Exclusive use of the device for the call's duration.
    pub fn infer(&mut self, input: ArrayView4<'_, f32>) -> Result<Embedding, AcceleratorError> {
        match &mut self.state {
            State::GraphAllocated { graph, version, .. } => {
                let values = graph.infer(input)?;
                if values.is_empty() {
                    return Err(AcceleratorError::Inference("graph produced an empty output".into()));
                }
                Ok(Embedding {
                    values,
                    model_version: Some(version.clone()),
                })
            }
            State::Opened { .. } => Err(AcceleratorError::NotAllocated),
            State::Closed => Err(AcceleratorError::SessionClosed),
        }
    }

    /// Deallocate the graph, then close the device. Idempotent.
    pub fn close(&mut self) {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::GraphAllocated {
                mut device, graph, ..
            } => {
                drop(graph);
                tracing::info!(device = %self.device_name, "graph deallocated");
                device.close();
                tracing::info!(device = %self.device_name, "accelerator device closed");
            }
            State::Opened { mut device } => {
                device.close();
                tracing::info!(device = %self.device_name, "accelerator device closed");
            }
            State::Closed => {}
        }
    }
}

impl Drop for AcceleratorSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Process-wide handle to the accelerator. Every inference from every thread
/// is serialized on the inner lock.
#[derive(Clone)]
pub struct SharedSession {
    inner: Arc<Mutex<AcceleratorSession>>,
    slow_infer: Duration,
}

impl SharedSession {
    pub fn new(session: AcceleratorSession, slow_infer: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
            slow_infer,
        }
    }

    pub fn infer(&self, input: ArrayView4<'_, f32>) -> Result<Embedding, AcceleratorError> {
        let mut session = self.lock();
        let started = Instant::now();
        let result = session.infer(input);
        let elapsed = started.elapsed();
        if elapsed > self.slow_infer {
            tracing::warn!(
                device = %session.device_name(),
                elapsed_ms = elapsed.as_millis() as u64,
                "slow inference call"
            );
        }
        result
    }

    pub fn model_version(&self) -> Option<String> {
        self.lock().model_version().map(str::to_string)
    }

    pub fn state(&self) -> SessionState {
        self.lock().state()
    }

    pub fn device_name(&self) -> String {
        self.lock().device_name().to_string()
    }

    /// Close the session for every holder of this handle.
    pub fn close(&self) {
        self.lock().close();
    }

    fn lock(&self) -> MutexGuard<'_, AcceleratorSession> {
        // State transitions never straddle a graph call, so a poisoned lock
        // still guards a consistent session.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Short hex fingerprint (first 8 bytes of SHA-256) identifying a graph.
pub fn graph_fingerprint(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory device used by the tests of every module in this crate.

    use super::*;

    /// Graph whose "embedding" is the mean of each input channel over a 2×2
    /// grid of tiles. Deterministic and sensitive to image content.
    pub struct TileMeanGraph {
        pub log: Arc<Mutex<Vec<String>>>,
    }

    impl Graph for TileMeanGraph {
        fn infer(&mut self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>, AcceleratorError> {
            let (_, h, w, c) = input.dim();
            let mut out = Vec::with_capacity(4 * c);
            for ty in 0..2 {
                for tx in 0..2 {
                    for ch in 0..c {
                        let mut sum = 0.0f32;
                        let mut n = 0usize;
                        for y in (ty * h / 2)..((ty + 1) * h / 2) {
                            for x in (tx * w / 2)..((tx + 1) * w / 2) {
                                sum += input[[0, y, x, ch]];
                                n += 1;
                            }
                        }
                        out.push(if n > 0 { sum / n as f32 } else { 0.0 });
                    }
                }
            }
            Ok(out)
        }
    }

    impl Drop for TileMeanGraph {
        fn drop(&mut self) {
            self.log.lock().unwrap().push("graph released".into());
        }
    }

    pub struct FakeDevice {
        pub name: String,
        pub log: Arc<Mutex<Vec<String>>>,
    }

    impl FakeDevice {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.into(),
                log: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Device for FakeDevice {
        fn name(&self) -> &str {
            &self.name
        }

        fn allocate(&mut self, graph: &[u8]) -> Result<Box<dyn Graph>, AcceleratorError> {
            if !graph.starts_with(b"GRAPH") {
                return Err(AcceleratorError::GraphLoad("bad magic".into()));
            }
            Ok(Box::new(TileMeanGraph {
                log: self.log.clone(),
            }))
        }

        fn close(&mut self) {
            self.log.lock().unwrap().push("device closed".into());
        }
    }

    /// A shared session with a tile-mean graph already allocated.
    pub fn fake_session() -> SharedSession {
        let mut session =
            AcceleratorSession::open(vec![Box::new(FakeDevice::new("fake0"))]).unwrap();
        session.load_graph(b"GRAPH-tilemean").unwrap();
        SharedSession::new(session, Duration::from_secs(5))
    }
}
