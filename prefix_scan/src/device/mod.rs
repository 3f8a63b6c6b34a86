//! Device sessions the scan engine runs on.
//!
//! A [`Device`] owns whatever context and queue its backend needs, builds the
//! two scan kernels, moves sequences to and from device buffers and runs 1-D
//! launches. Every operation blocks until the device has finished it, so
//! operations on one buffer complete in submission order.

#[cfg(feature = "cuda")]
mod cuda;
mod host;

#[cfg(feature = "cuda")]
pub use cuda::CudaDevice;
pub use host::{HostBuffer, HostDevice, HostProgram};

use crate::error::ScanError;

/// The scan kernels a compiled program exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    /// Block-local inclusive scan at one period.
    Calculate,
    /// Adds the totals of preceding blocks at one period.
    Propagate,
}

impl Kernel {
    pub fn entry_point(&self) -> &'static str {
        match self {
            Kernel::Calculate => "scan_hillis_steele_calculate",
            Kernel::Propagate => "scan_hillis_steele_propagate",
        }
    }
}

/// Scalar arguments of a scan kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelArgs {
    /// Number of elements in the buffer.
    pub len: usize,
    /// Distance between the elements a launch operates on.
    pub period: usize,
    /// Element count of each of the two block-local scratch regions.
    pub local_len: usize,
}

pub trait Device {
    type Buffer;
    type Program;

    fn name(&self) -> &str;

    /// Largest work-group this device can launch the scan kernels with.
    fn max_block_size(&self) -> usize;

    /// Builds the calculate and propagate kernels.
    fn compile(&self) -> Result<Self::Program, ScanError>;

    fn upload(&self, data: &[f32]) -> Result<Self::Buffer, ScanError>;

    /// Copies the first `count` elements of `buffer` back to the host. Asking
    /// for more than the buffer holds is an invalid argument.
    fn download(&self, buffer: &Self::Buffer, count: usize) -> Result<Vec<f32>, ScanError>;

    /// Runs `kernel` over `global_count` work-items grouped into blocks of
    /// `block_size`, rounding the launch up with
    /// [`launch_width`](crate::launch::launch_width), and waits for it.
    fn launch_1d(
        &self,
        program: &Self::Program,
        kernel: Kernel,
        buffer: &mut Self::Buffer,
        args: KernelArgs,
        global_count: usize,
        block_size: usize,
    ) -> Result<(), ScanError>;
}

/// Build diagnostics of one compilation. The text is logged when the log is
/// dropped, so it shows up whether or not the build succeeded.
#[derive(Debug)]
pub struct BuildLog {
    device: String,
    text: String,
}

impl BuildLog {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            text: String::new(),
        }
    }

    pub fn push(&mut self, line: impl AsRef<str>) {
        let line = line.as_ref().trim_end();
        if line.is_empty() {
            return;
        }
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(line);
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Turns the log into a compilation failure carrying its text.
    pub fn into_failure(self) -> ScanError {
        ScanError::CompilationFailure {
            log: self.text.clone(),
        }
    }
}

impl Drop for BuildLog {
    fn drop(&mut self) {
        if !self.text.is_empty() {
            tracing::info!(device = %self.device, "build log:\n{}", self.text);
        }
    }
}
