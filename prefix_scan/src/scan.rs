//! Recursive hierarchical Hillis-Steele scan.
//!
//! A scan of `n` elements first scans blocks of `B` consecutive elements. The
//! last element of every block then holds its block total, so the array viewed
//! at period `B` is scanned the same way, and so on until one block covers the
//! whole array. Walking back down, each level adds the now global totals of the
//! preceding blocks into the elements of the finer level.

use crate::config::ScanConfig;
use crate::device::{Device, HostDevice, Kernel, KernelArgs};
use crate::error::ScanError;
use crate::launch::scan_periods;
use std::time::Instant;

/// Runs inclusive scans on one device with a fixed block size. The kernels are
/// compiled once and reused by every scan.
pub struct Scanner<'d, D: Device> {
    device: &'d D,
    program: D::Program,
    block_size: usize,
}

impl<'d, D: Device> Scanner<'d, D> {
    pub fn new(device: &'d D, config: &ScanConfig) -> Result<Self, ScanError> {
        config.validate(device.max_block_size())?;
        let program = device.compile()?;
        Ok(Self {
            device,
            program,
            block_size: config.block_size,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Inclusive prefix sum of `xs`.
    pub fn scan(&self, xs: &[f32]) -> Result<Vec<f32>, ScanError> {
        if xs.is_empty() {
            return Ok(Vec::new());
        }

        let now = Instant::now();
        let mut dev_xs = self.device.upload(xs)?;
        self.scan_period(&mut dev_xs, xs.len(), 1)?;
        let ys = self.device.download(&dev_xs, xs.len())?;

        tracing::debug!(
            device = self.device.name(),
            len = xs.len(),
            levels = scan_periods(xs.len(), self.block_size).count(),
            elapsed = ?now.elapsed(),
            "scan finished"
        );
        Ok(ys)
    }

    /// Scans the elements of `buffer` that end a period, then, if more than one
    /// block of them exists, resolves the coarser period before propagating
    /// its totals back into this one.
    fn scan_period(
        &self,
        buffer: &mut D::Buffer,
        len: usize,
        period: usize,
    ) -> Result<(), ScanError> {
        if period > len {
            return Ok(());
        }

        self.launch(Kernel::Calculate, buffer, len, period)?;

        match period.checked_mul(self.block_size) {
            Some(coarser) if coarser < len => {
                self.scan_period(buffer, len, coarser)?;
                self.launch(Kernel::Propagate, buffer, len, period)
            }
            _ => Ok(()),
        }
    }

    fn launch(
        &self,
        kernel: Kernel,
        buffer: &mut D::Buffer,
        len: usize,
        period: usize,
    ) -> Result<(), ScanError> {
        let local_len = match kernel {
            Kernel::Calculate => self.block_size,
            Kernel::Propagate => 0,
        };
        let args = KernelArgs {
            len,
            period,
            local_len,
        };
        tracing::debug!(kernel = kernel.entry_point(), len, period, "launch");
        self.device
            .launch_1d(&self.program, kernel, buffer, args, len, self.block_size)
    }
}

/// Inclusive prefix sum of `xs` on a host device.
pub fn inclusive_scan(xs: &[f32], config: &ScanConfig) -> Result<Vec<f32>, ScanError> {
    let device = HostDevice::new()?;
    let scanner = Scanner::new(&device, config)?;
    scanner.scan(xs)
}

/// Inclusive prefix sum computed one element at a time.
pub fn sequential_scan(xs: &[f32]) -> Vec<f32> {
    xs.iter()
        .scan(0.0f32, |sum, &x| {
            *sum += x;
            Some(*sum)
        })
        .collect()
}

/// Largest difference between `expected` and `actual`, relative to the
/// magnitude of the expected value (or absolute when it is below 1).
pub fn max_relative_error(expected: &[f32], actual: &[f32]) -> f32 {
    expected
        .iter()
        .zip(actual)
        .map(|(&e, &a)| (e - a).abs() / e.abs().max(1.0))
        .fold(0.0, f32::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BuildLog, HostBuffer, HostProgram};
    use proptest::prelude::*;
    use rand::{Rng, SeedableRng};
    use rand_hc::Hc128Rng;
    use std::cell::{Cell, RefCell};
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    const SEED: &[u8; 32] = b"e3Xq0cUuKJ8bqzvN2WYtR7mPa5LhdG1s";

    #[derive(Debug, Clone, PartialEq)]
    struct Launch {
        kernel: Kernel,
        period: usize,
        after: Vec<f32>,
    }

    #[derive(Debug, Clone, Copy)]
    enum Broken {
        Compiler,
        Lost,
    }

    /// Host device that records every launch and can fail on purpose.
    struct RecordingDevice {
        inner: HostDevice,
        launches: RefCell<Vec<Launch>>,
        uploads: Cell<usize>,
        fail_at: Option<usize>,
        broken: Option<Broken>,
    }

    impl RecordingDevice {
        fn new() -> Self {
            Self {
                inner: HostDevice::with_threads(2).unwrap(),
                launches: RefCell::new(Vec::new()),
                uploads: Cell::new(0),
                fail_at: None,
                broken: None,
            }
        }

        fn broken(broken: Broken) -> Self {
            Self {
                broken: Some(broken),
                ..Self::new()
            }
        }

        fn failing_at(launch: usize) -> Self {
            Self {
                fail_at: Some(launch),
                ..Self::new()
            }
        }

        fn order(&self) -> Vec<(Kernel, usize)> {
            self.launches
                .borrow()
                .iter()
                .map(|l| (l.kernel, l.period))
                .collect()
        }
    }

    impl Device for RecordingDevice {
        type Buffer = HostBuffer;
        type Program = HostProgram;

        fn name(&self) -> &str {
            "recording"
        }

        fn max_block_size(&self) -> usize {
            self.inner.max_block_size()
        }

        fn compile(&self) -> Result<HostProgram, ScanError> {
            let mut log = BuildLog::new(self.name());
            match self.broken {
                Some(Broken::Compiler) => {
                    log.push("error: use of undeclared identifier 'scratch'");
                    Err(log.into_failure())
                }
                Some(Broken::Lost) => {
                    Err(ScanError::DeviceUnavailable("device lost".to_string()))
                }
                None => {
                    log.push("2 kernels built");
                    self.inner.compile()
                }
            }
        }

        fn upload(&self, data: &[f32]) -> Result<HostBuffer, ScanError> {
            self.uploads.set(self.uploads.get() + 1);
            self.inner.upload(data)
        }

        fn download(&self, buffer: &HostBuffer, count: usize) -> Result<Vec<f32>, ScanError> {
            self.inner.download(buffer, count)
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
            if self.fail_at == Some(self.launches.borrow().len()) {
                return Err(ScanError::DeviceExecution {
                    operation: kernel.entry_point(),
                    code: -5,
                });
            }
            self.inner
                .launch_1d(program, kernel, buffer, args, global_count, block_size)?;
            self.launches.borrow_mut().push(Launch {
                kernel,
                period: args.period,
                after: buffer.as_slice().to_vec(),
            });
            Ok(())
        }
    }

    fn assert_scan_close(xs: &[f32], ys: &[f32]) {
        assert_eq!(xs.len(), ys.len());
        let expected = sequential_scan(xs);
        let err = max_relative_error(&expected, ys);
        assert!(err < 1e-4, "relative error {err} too large");
    }

    #[test]
    fn scan_small_example() {
        let device = HostDevice::with_threads(2).unwrap();
        let scanner = Scanner::new(&device, &ScanConfig::with_block_size(4)).unwrap();
        let xs = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let ys = scanner.scan(&xs).unwrap();
        assert_eq!(ys, vec![1.0, 3.0, 6.0, 10.0, 15.0, 21.0, 28.0, 36.0]);
    }

    #[test]
    fn empty_input_does_no_device_work() {
        let device = RecordingDevice::new();
        let scanner = Scanner::new(&device, &ScanConfig::with_block_size(4)).unwrap();
        assert_eq!(scanner.scan(&[]).unwrap(), Vec::<f32>::new());
        assert_eq!(device.uploads.get(), 0);
        assert!(device.launches.borrow().is_empty());
    }

    #[test]
    fn single_element() {
        let device = RecordingDevice::new();
        let scanner = Scanner::new(&device, &ScanConfig::with_block_size(4)).unwrap();
        assert_eq!(scanner.scan(&[-2.5]).unwrap(), vec![-2.5]);
        assert_eq!(device.order(), vec![(Kernel::Calculate, 1)]);
    }

    #[test]
    fn one_full_block_needs_no_propagation() {
        let device = RecordingDevice::new();
        let scanner = Scanner::new(&device, &ScanConfig::with_block_size(8)).unwrap();
        let xs = [1.0, 1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 21.0];
        let ys = scanner.scan(&xs).unwrap();
        assert_eq!(ys, sequential_scan(&xs));
        assert_eq!(device.order(), vec![(Kernel::Calculate, 1)]);
    }

    #[test]
    fn coarser_level_resolves_before_propagation() {
        let block_size = 4;
        let device = RecordingDevice::new();
        let scanner = Scanner::new(&device, &ScanConfig::with_block_size(block_size)).unwrap();
        let xs = (1..=16).map(|x| x as f32).collect::<Vec<_>>();
        let ys = scanner.scan(&xs).unwrap();
        assert_eq!(ys, sequential_scan(&xs));

        assert_eq!(
            device.order(),
            vec![
                (Kernel::Calculate, 1),
                (Kernel::Calculate, block_size),
                (Kernel::Propagate, 1),
            ]
        );

        // After the coarser calculate, every block end holds its global prefix
        // sum, and those are exactly the carries the propagation adds.
        let launches = device.launches.borrow();
        let coarse = &launches[1].after;
        for end in [3, 7, 11, 15] {
            assert_eq!(coarse[end], ys[end]);
        }
        let fine = &launches[0].after;
        for i in 4..16 {
            let carry = coarse[(i / block_size) * block_size - 1];
            if (i + 1) % block_size != 0 {
                assert_eq!(fine[i] + carry, ys[i]);
            }
        }
    }

    #[test]
    fn launch_counts_follow_periods() {
        for (len, block_size) in [(17, 4), (64, 4), (65, 4), (1000, 8), (4096, 2)] {
            let device = RecordingDevice::new();
            let scanner = Scanner::new(&device, &ScanConfig::with_block_size(block_size)).unwrap();
            let xs = vec![1.0; len];
            let ys = scanner.scan(&xs).unwrap();
            assert_scan_close(&xs, &ys);

            let levels = scan_periods(len, block_size).count();
            let order = device.order();
            let calculates = order.iter().filter(|(k, _)| *k == Kernel::Calculate).count();
            assert_eq!(calculates, levels);
            assert_eq!(order.len() - calculates, levels - 1);
        }
    }

    #[test]
    fn launch_failure_aborts_scan() {
        // Fail the first propagation of a three-level scan.
        let device = RecordingDevice::failing_at(3);
        let scanner = Scanner::new(&device, &ScanConfig::with_block_size(4)).unwrap();
        let xs = vec![1.0; 40];
        match scanner.scan(&xs) {
            Err(ScanError::DeviceExecution { operation, code }) => {
                assert_eq!(operation, "scan_hillis_steele_propagate");
                assert_eq!(code, -5);
            }
            other => panic!("expected a device error, got {other:?}"),
        }
        assert_eq!(device.launches.borrow().len(), 3);
    }

    /// Collects everything a `tracing` subscriber writes.
    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl CapturedLog {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn with_captured_log<T>(f: impl FnOnce() -> T) -> (T, String) {
        let captured = CapturedLog::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let result = tracing::subscriber::with_default(subscriber, f);
        (result, captured.text())
    }

    #[test]
    fn compilation_failure_carries_build_log() {
        let device = RecordingDevice::broken(Broken::Compiler);
        let (result, logged) =
            with_captured_log(|| Scanner::new(&device, &ScanConfig::default()).map(|_| ()));
        match result {
            Err(ScanError::CompilationFailure { log }) => {
                assert_eq!(log, "error: use of undeclared identifier 'scratch'");
            }
            other => panic!("expected a compilation failure, got {other:?}"),
        }
        assert!(logged.contains("build log"));
        assert!(logged.contains("use of undeclared identifier 'scratch'"));
        assert_eq!(device.uploads.get(), 0);
    }

    #[test]
    fn build_log_is_emitted_on_success() {
        let device = RecordingDevice::new();
        let (result, logged) =
            with_captured_log(|| Scanner::new(&device, &ScanConfig::default()).map(|_| ()));
        assert!(result.is_ok());
        assert!(logged.contains("2 kernels built"));
    }

    #[test]
    fn unavailable_device_is_reported() {
        let device = RecordingDevice::broken(Broken::Lost);
        let result = Scanner::new(&device, &ScanConfig::default());
        assert!(matches!(result, Err(ScanError::DeviceUnavailable(_))));
    }

    #[test]
    fn rejects_degenerate_block_size() {
        let device = HostDevice::with_threads(1).unwrap();
        let result = Scanner::new(&device, &ScanConfig::with_block_size(1));
        assert!(matches!(result, Err(ScanError::InvalidArgument(_))));
    }

    #[test]
    fn scanner_is_reusable() {
        let device = HostDevice::with_threads(2).unwrap();
        let scanner = Scanner::new(&device, &ScanConfig::with_block_size(16)).unwrap();
        let first = scanner.scan(&[1.0; 100]).unwrap();
        let second = scanner.scan(&[2.0; 50]).unwrap();
        assert_eq!(first[99], 100.0);
        assert_eq!(second.len(), 50);
        assert_eq!(second[49], 100.0);
    }

    #[test]
    fn random_inputs_match_sequential() {
        let mut rng = Hc128Rng::from_seed(*SEED);
        let device = HostDevice::with_threads(4).unwrap();
        let scanner = Scanner::new(&device, &ScanConfig::default()).unwrap();
        for len in [255, 256, 257, 65_536, 65_537, 300_000] {
            let xs = (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect::<Vec<f32>>();
            let ys = scanner.scan(&xs).unwrap();

            // Reference in f64 so only the device's rounding is measured.
            let mut sum = 0.0f64;
            for (i, (&x, &y)) in xs.iter().zip(&ys).enumerate() {
                sum += f64::from(x);
                assert!((sum - f64::from(y)).abs() < 1e-2, "mismatch at {i}: {sum} vs {y}");
            }
        }
    }

    #[test]
    fn inclusive_scan_uses_host_device() {
        let ys = inclusive_scan(&[0.5; 1000], &ScanConfig::with_block_size(32)).unwrap();
        assert_eq!(ys[999], 500.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn scan_matches_sequential(
            xs in prop::collection::vec(-100i16..100, 0..2000),
            block_size in 2usize..40,
        ) {
            // Integral values keep every partial sum exact in f32.
            let xs = xs.into_iter().map(f32::from).collect::<Vec<_>>();
            let device = HostDevice::with_threads(2).unwrap();
            let scanner = Scanner::new(&device, &ScanConfig::with_block_size(block_size)).unwrap();
            let ys = scanner.scan(&xs).unwrap();
            prop_assert_eq!(ys, sequential_scan(&xs));
        }
    }
}
