use clap::{Parser, ValueEnum};
use prefix_scan::config::DEFAULT_BLOCK_SIZE;
use prefix_scan::device::HostDevice;
use prefix_scan::scan::max_relative_error;
use prefix_scan::{io, sequential_scan, Device, ScanConfig, ScanError, Scanner};
use std::{error::Error, fs::File, io::BufWriter, path::PathBuf, process::ExitCode, time::Instant};
use tracing_subscriber::EnvFilter;

/// Relative error above which `--verify` reports a mismatch.
const VERIFY_TOLERANCE: f32 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Kernels run on a CPU thread pool
    Host,
    /// Kernels run on a CUDA device (needs the `cuda` feature)
    Cuda,
}

#[derive(Debug, Parser)]
#[command(name = "prefix_scan", about = "Inclusive prefix sum on a data-parallel device")]
struct Cli {
    /// Element count followed by the values
    #[arg(long, default_value = "input.txt")]
    input: PathBuf,
    /// Where the scanned values are written
    #[arg(long, default_value = "output.txt")]
    output: PathBuf,
    /// Work-group size of every kernel launch
    #[arg(long, env = "PREFIX_SCAN_BLOCK_SIZE", default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: usize,
    #[arg(long, value_enum, default_value_t = Backend::Host)]
    device: Backend,
    /// Host device pool size, 0 for one thread per core
    #[arg(long, default_value_t = 0)]
    threads: usize,
    /// CUDA device ordinal
    #[arg(long, default_value_t = 0)]
    ordinal: u32,
    /// PTX module to load instead of the bundled kernels
    #[arg(long)]
    ptx: Option<PathBuf>,
    /// Decimals written per value
    #[arg(long, default_value_t = 3)]
    precision: usize,
    /// Compare the result with a sequential scan
    #[arg(long)]
    verify: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn Error>> {
    let xs = io::read_sequence(File::open(&cli.input)?)?;
    tracing::info!(path = %cli.input.display(), len = xs.len(), "read input");

    let config = ScanConfig::with_block_size(cli.block_size);
    let ys = match cli.device {
        Backend::Host => scan_on(&HostDevice::with_threads(cli.threads)?, &config, &xs)?,
        Backend::Cuda => scan_on_cuda(cli, &config, &xs)?,
    };

    if cli.verify {
        let err = max_relative_error(&sequential_scan(&xs), &ys);
        if err > VERIFY_TOLERANCE {
            tracing::warn!(max_relative_error = err, "result differs from sequential scan");
        } else {
            tracing::info!(max_relative_error = err, "result matches sequential scan");
        }
    }

    let mut out = BufWriter::new(File::create(&cli.output)?);
    io::write_sequence(&mut out, &ys, cli.precision)?;
    tracing::info!(path = %cli.output.display(), "wrote output");
    Ok(())
}

fn scan_on<D: Device>(device: &D, config: &ScanConfig, xs: &[f32]) -> Result<Vec<f32>, ScanError> {
    let now = Instant::now();
    let ys = Scanner::new(device, config)?.scan(xs)?;
    tracing::info!(
        device = device.name(),
        block_size = config.block_size,
        elapsed = ?now.elapsed(),
        "scanned {} values",
        xs.len()
    );
    Ok(ys)
}

#[cfg(feature = "cuda")]
fn scan_on_cuda(cli: &Cli, config: &ScanConfig, xs: &[f32]) -> Result<Vec<f32>, Box<dyn Error>> {
    use prefix_scan::device::CudaDevice;

    let device = match &cli.ptx {
        Some(path) => CudaDevice::with_ptx(cli.ordinal, std::fs::read_to_string(path)?.into())?,
        None => CudaDevice::new(cli.ordinal)?,
    };
    Ok(scan_on(&device, config, xs)?)
}

#[cfg(not(feature = "cuda"))]
fn scan_on_cuda(_cli: &Cli, _config: &ScanConfig, _xs: &[f32]) -> Result<Vec<f32>, Box<dyn Error>> {
    Err(ScanError::DeviceUnavailable("built without the `cuda` feature".to_string()).into())
}
