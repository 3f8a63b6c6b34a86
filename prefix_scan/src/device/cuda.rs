use super::{BuildLog, Device as ScanDevice, Kernel, KernelArgs};
use crate::error::ScanError;
use crate::launch::group_count;
use cust::context::Context;
use cust::device::{Device, DeviceAttribute};
use cust::error::CudaError;
use cust::prelude::*;
use cust::CudaFlags;
use scan_gpu::kernels::MAX_BLOCK_SIZE as KERNEL_MAX_BLOCK_SIZE;
use std::borrow::Cow;

static PTX: &str = include_str!("../../../resources/scan_gpu.ptx");

/// A CUDA device with its own context and stream.
pub struct CudaDevice {
    stream: Stream,
    name: String,
    max_block_size: usize,
    ptx: Cow<'static, str>,
    // Dropped last; everything above lives in this context.
    _context: Context,
}

fn execution_error(operation: &'static str) -> impl Fn(CudaError) -> ScanError {
    move |err| {
        tracing::debug!(operation, error = %err, "CUDA call failed");
        ScanError::DeviceExecution {
            operation,
            code: err as i64,
        }
    }
}

impl CudaDevice {
    /// Opens the device with the given ordinal and loads the bundled kernels.
    pub fn new(ordinal: u32) -> Result<Self, ScanError> {
        Self::with_ptx(ordinal, Cow::Borrowed(PTX))
    }

    /// Opens the device with the given ordinal, building kernels from `ptx`.
    pub fn with_ptx(ordinal: u32, ptx: Cow<'static, str>) -> Result<Self, ScanError> {
        let unavailable = |err: CudaError| ScanError::DeviceUnavailable(err.to_string());

        cust::init(CudaFlags::empty()).map_err(unavailable)?;
        let count = Device::num_devices().map_err(unavailable)?;
        if ordinal >= count {
            return Err(ScanError::DeviceUnavailable(format!(
                "no CUDA device with ordinal {} ({} found)",
                ordinal, count
            )));
        }

        let device = Device::get_device(ordinal).map_err(unavailable)?;
        let context = Context::new(device).map_err(unavailable)?;
        let stream = Stream::new(StreamFlags::NON_BLOCKING, None).map_err(unavailable)?;

        let name = device.name().map_err(unavailable)?;
        let threads = device
            .get_attribute(DeviceAttribute::MaxThreadsPerBlock)
            .map_err(unavailable)?;
        let max_block_size = (threads.max(0) as usize).min(KERNEL_MAX_BLOCK_SIZE);
        tracing::info!(device = %name, ordinal, max_block_size, "opened CUDA device");

        Ok(Self {
            stream,
            name,
            max_block_size,
            ptx,
            _context: context,
        })
    }
}

impl ScanDevice for CudaDevice {
    type Buffer = DeviceBuffer<f32>;
    type Program = Module;

    fn name(&self) -> &str {
        &self.name
    }

    fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    fn compile(&self) -> Result<Module, ScanError> {
        let mut log = BuildLog::new(self.name.as_str());
        let module = match Module::from_ptx(self.ptx.as_ref(), &[]) {
            Ok(module) => module,
            Err(err) => {
                log.push(format!("loading PTX module failed: {err}"));
                return Err(log.into_failure());
            }
        };

        for kernel in [Kernel::Calculate, Kernel::Propagate] {
            if let Err(err) = module.get_function(kernel.entry_point()) {
                log.push(format!("missing kernel {}: {err}", kernel.entry_point()));
                return Err(log.into_failure());
            }
            log.push(format!("{}: loaded", kernel.entry_point()));
        }
        Ok(module)
    }

    fn upload(&self, data: &[f32]) -> Result<DeviceBuffer<f32>, ScanError> {
        DeviceBuffer::from_slice(data).map_err(execution_error("upload"))
    }

    fn download(&self, buffer: &DeviceBuffer<f32>, count: usize) -> Result<Vec<f32>, ScanError> {
        if count > buffer.len() {
            return Err(ScanError::invalid_argument(format!(
                "cannot download {} elements from a buffer of {}",
                count,
                buffer.len()
            )));
        }
        let mut data = vec![0.0f32; buffer.len()];
        buffer
            .copy_to(&mut data)
            .map_err(execution_error("download"))?;
        data.truncate(count);
        Ok(data)
    }

    fn launch_1d(
        &self,
        program: &Module,
        kernel: Kernel,
        buffer: &mut DeviceBuffer<f32>,
        args: KernelArgs,
        global_count: usize,
        block_size: usize,
    ) -> Result<(), ScanError> {
        if block_size == 0 || block_size > self.max_block_size {
            return Err(ScanError::invalid_argument(format!(
                "work-group size {} is outside 1..={}",
                block_size, self.max_block_size
            )));
        }
        if args.len > buffer.len() {
            return Err(ScanError::invalid_argument(format!(
                "launch covers {} elements but the buffer holds {}",
                args.len,
                buffer.len()
            )));
        }

        let operation = kernel.entry_point();
        let groups = u32::try_from(group_count(global_count, block_size)).map_err(|_| {
            ScanError::invalid_argument(format!(
                "{} work-items exceed the grid limit",
                global_count
            ))
        })?;
        let function = program
            .get_function(operation)
            .map_err(execution_error(operation))?;
        let stream = &self.stream;

        // The scratch arrays are static shared memory sized for the largest
        // block, so no dynamic shared memory is requested.
        unsafe {
            launch!(
                function<<<groups, block_size as u32, 0, stream>>>(
                    buffer.as_device_ptr(),
                    args.len,
                    args.period
                )
            )
            .map_err(execution_error(operation))?;
        }
        stream
            .synchronize()
            .map_err(execution_error("synchronize"))
    }
}
