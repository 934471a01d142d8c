//! ONNX Runtime backend for the accelerator session.
//!
//! Each usable execution provider is exposed as one [`Device`]. CUDA is
//! enumerated first when the runtime reports it available; CPU is always
//! available.

use crate::accelerator::{AcceleratorError, Device, Graph};
use ndarray::ArrayView4;
use ort::execution_providers::{CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider};
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};

/// Which devices the operator allows the session to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// CUDA when available, otherwise CPU.
    #[default]
    Auto,
    Cpu,
    Cuda,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda),
            other => Err(format!("unknown device preference: {other} (expected auto, cpu, cuda)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionTarget {
    Cuda,
    Cpu,
}

impl ExecutionTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cuda => "onnx-cuda",
            Self::Cpu => "onnx-cpu",
        }
    }
}

/// Execution targets permitted by `preference`, in selection order.
pub fn enumerate_targets(preference: DevicePreference, cuda_available: bool) -> Vec<ExecutionTarget> {
    let mut targets = Vec::new();
    if matches!(preference, DevicePreference::Auto | DevicePreference::Cuda) && cuda_available {
        targets.push(ExecutionTarget::Cuda);
    }
    if matches!(preference, DevicePreference::Auto | DevicePreference::Cpu) {
        targets.push(ExecutionTarget::Cpu);
    }
    targets
}

/// Enumerate ONNX Runtime devices permitted by `preference`.
pub fn enumerate_devices(preference: DevicePreference, intra_threads: usize) -> Vec<Box<dyn Device>> {
    let targets = enumerate_targets(preference, cuda_available());
    tracing::debug!(?preference, ?targets, "enumerated ONNX execution targets");
    targets
        .into_iter()
        .map(|target| Box::new(OnnxDevice::new(target, intra_threads)) as Box<dyn Device>)
        .collect()
}

fn cuda_available() -> bool {
    match CUDAExecutionProvider::default().is_available() {
        Ok(available) => available,
        Err(e) => {
            tracing::debug!(error = %e, "CUDA availability probe failed");
            false
        }
    }
}

/// One ONNX Runtime execution provider acting as an accelerator device.
pub struct OnnxDevice {
    target: ExecutionTarget,
    intra_threads: usize,
}

impl OnnxDevice {
    pub fn new(target: ExecutionTarget, intra_threads: usize) -> Self {
        Self {
            target,
            intra_threads: intra_threads.max(1),
        }
    }
}

impl Device for OnnxDevice {
    fn name(&self) -> &str {
        self.target.as_str()
    }

    fn allocate(&mut self, graph: &[u8]) -> Result<Box<dyn Graph>, AcceleratorError> {
        let session = build_session(self.target, self.intra_threads, graph)
            .map_err(|e| AcceleratorError::GraphLoad(e.to_string()))?;

        tracing::info!(
            device = self.target.as_str(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded embedding graph"
        );

        Ok(Box::new(OnnxGraph { session }))
    }
}

fn build_session(target: ExecutionTarget, intra_threads: usize, graph: &[u8]) -> ort::Result<Session> {
    let builder = Session::builder()?.with_intra_threads(intra_threads)?;
    let builder = match target {
        ExecutionTarget::Cuda => {
            builder.with_execution_providers([CUDAExecutionProvider::default().build()])?
        }
        ExecutionTarget::Cpu => {
            builder.with_execution_providers([CPUExecutionProvider::default().build()])?
        }
    };
    builder.commit_from_memory(graph)
}

struct OnnxGraph {
    session: Session,
}

impl OnnxGraph {
    fn run(&mut self, input: ArrayView4<'_, f32>) -> ort::Result<Vec<f32>> {
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input)?])?;
        let (_, data) = outputs[0].try_extract_tensor::<f32>()?;
        Ok(data.to_vec())
    }
}

impl Graph for OnnxGraph {
    fn infer(&mut self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>, AcceleratorError> {
        self.run(input)
            .map_err(|e| AcceleratorError::Inference(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_prefers_cuda_then_cpu() {
        assert_eq!(
            enumerate_targets(DevicePreference::Auto, true),
            vec![ExecutionTarget::Cuda, ExecutionTarget::Cpu]
        );
        assert_eq!(
            enumerate_targets(DevicePreference::Auto, false),
            vec![ExecutionTarget::Cpu]
        );
    }

    #[test]
    fn test_cuda_only_without_cuda_is_empty() {
        assert!(enumerate_targets(DevicePreference::Cuda, false).is_empty());
    }

    #[test]
    fn test_cpu_never_offers_cuda() {
        assert_eq!(
            enumerate_targets(DevicePreference::Cpu, true),
            vec![ExecutionTarget::Cpu]
        );
    }

    #[test]
    fn test_preference_parse() {
        assert_eq!("CUDA".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda);
        assert_eq!("auto".parse::<DevicePreference>().unwrap(), DevicePreference::Auto);
        assert!("movidius".parse::<DevicePreference>().is_err());
    }
}
