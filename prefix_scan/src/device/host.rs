use super::{BuildLog, Device, Kernel, KernelArgs};
use crate::error::ScanError;
use crate::launch::{group_count, mult_step, strided_index};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

/// Work-group limit of the host device, matching common GPU limits.
pub const HOST_MAX_BLOCK_SIZE: usize = 1024;

/// A software device that runs the scan kernels on the CPU.
///
/// Work-groups are spread over a dedicated rayon pool. Each work-group owns a
/// contiguous slice of the buffer and steps its lanes together, one barrier
/// interval at a time, so the kernels see the same memory ordering they get on
/// a GPU.
pub struct HostDevice {
    pool: ThreadPool,
    name: String,
}

pub struct HostBuffer {
    data: Vec<f32>,
}

impl HostBuffer {
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

pub struct HostProgram {
    max_block_size: usize,
}

impl HostDevice {
    /// Creates a device backed by a pool with one thread per core.
    pub fn new() -> Result<Self, ScanError> {
        Self::with_threads(0)
    }

    /// Creates a device backed by a pool of `threads` threads, or one per core
    /// when `threads` is 0.
    pub fn with_threads(threads: usize) -> Result<Self, ScanError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("host-device-{i}"))
            .build()
            .map_err(|e| ScanError::DeviceUnavailable(e.to_string()))?;
        let name = format!("host ({} threads)", pool.current_num_threads());
        tracing::debug!(device = %name, "created host device");
        Ok(Self { pool, name })
    }

    fn calculate(&self, data: &mut [f32], args: KernelArgs, groups: usize, block_size: usize) {
        let span = block_size.saturating_mul(args.period);
        self.pool.install(|| {
            data.par_chunks_mut(span).take(groups).for_each_init(
                || (vec![0.0f32; block_size], vec![0.0f32; block_size]),
                |(front, back), group| scan_group(group, args.period, front, back),
            )
        });
    }

    fn propagate(&self, data: &mut [f32], args: KernelArgs, groups: usize, block_size: usize) {
        let span = block_size.saturating_mul(args.period);
        // The last lane of every group is never written, so the carries can
        // be read up front.
        let carries: Vec<f32> = (0..groups)
            .map(|group| match group {
                0 => 0.0,
                _ => data
                    .get(group.saturating_mul(span) - 1)
                    .copied()
                    .unwrap_or(0.0),
            })
            .collect();

        self.pool.install(|| {
            data.par_chunks_mut(span)
                .zip(carries)
                .skip(1)
                .for_each(|(group, carry)| {
                    for lane in 0..block_size - 1 {
                        match strided_index(lane, args.period, group.len()) {
                            Some(i) => group[i] += carry,
                            None => break,
                        }
                    }
                })
        });
    }
}

/// Hillis-Steele scan of the lanes of one work-group. `group` is the slice the
/// work-group covers; lane `t` owns `group[(t + 1) * period - 1]`.
fn scan_group(group: &mut [f32], period: usize, front: &mut [f32], back: &mut [f32]) {
    let lanes = front.len();
    for (lane, value) in front.iter_mut().enumerate() {
        *value = strided_index(lane, period, group.len())
            .map(|i| group[i])
            .unwrap_or(0.0);
    }

    let mut src = front;
    let mut dst = back;
    for stride in mult_step(1, 2).take_while(|&s| s < lanes) {
        for lane in 0..lanes {
            dst[lane] = if lane >= stride {
                src[lane] + src[lane - stride]
            } else {
                src[lane]
            };
        }
        std::mem::swap(&mut src, &mut dst);
    }

    for (lane, &value) in src.iter().enumerate() {
        match strided_index(lane, period, group.len()) {
            Some(i) => group[i] = value,
            None => break,
        }
    }
}

impl Device for HostDevice {
    type Buffer = HostBuffer;
    type Program = HostProgram;

    fn name(&self) -> &str {
        &self.name
    }

    fn max_block_size(&self) -> usize {
        HOST_MAX_BLOCK_SIZE
    }

    fn compile(&self) -> Result<HostProgram, ScanError> {
        let mut log = BuildLog::new(self.name.as_str());
        for kernel in [Kernel::Calculate, Kernel::Propagate] {
            log.push(format!("{}: native", kernel.entry_point()));
        }
        Ok(HostProgram {
            max_block_size: HOST_MAX_BLOCK_SIZE,
        })
    }

    fn upload(&self, data: &[f32]) -> Result<HostBuffer, ScanError> {
        Ok(HostBuffer {
            data: data.to_vec(),
        })
    }

    fn download(&self, buffer: &HostBuffer, count: usize) -> Result<Vec<f32>, ScanError> {
        buffer
            .data
            .get(..count)
            .map(|data| data.to_vec())
            .ok_or_else(|| {
                ScanError::invalid_argument(format!(
                    "cannot download {} elements from a buffer of {}",
                    count,
                    buffer.len()
                ))
            })
    }

    fn launch_1d(
        &self,
        program: &HostProgram,
        kernel: Kernel,
        buffer: &mut HostBuffer,
        args: KernelArgs,
        global_count: usize,
        block_size: usize,
    ) -> Result<(), ScanError> {
        if block_size == 0 || block_size > program.max_block_size {
            return Err(ScanError::invalid_argument(format!(
                "work-group size {} is outside 1..={}",
                block_size, program.max_block_size
            )));
        }
        if args.period == 0 {
            return Err(ScanError::invalid_argument("period must be positive"));
        }
        if args.len > buffer.len() {
            return Err(ScanError::invalid_argument(format!(
                "launch covers {} elements but the buffer holds {}",
                args.len,
                buffer.len()
            )));
        }

        let groups = group_count(global_count, block_size);
        let data = &mut buffer.data[..args.len];
        match kernel {
            Kernel::Calculate => {
                if args.local_len < block_size {
                    return Err(ScanError::invalid_argument(format!(
                        "scratch of {} elements is smaller than the work-group size {}",
                        args.local_len, block_size
                    )));
                }
                self.calculate(data, args, groups, block_size);
            }
            Kernel::Propagate => self.propagate(data, args, groups, block_size),
        }
        Ok(())
    }
}
