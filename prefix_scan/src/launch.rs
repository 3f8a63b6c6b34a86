//! Launch geometry shared by the scan engine and the device backends.

/// Smallest multiple of `block_size` that covers `global_count` work-items.
/// Kernels ignore the work-items past `global_count`.
pub fn launch_width(global_count: usize, block_size: usize) -> usize {
    global_count.div_ceil(block_size) * block_size
}

/// Number of work-groups in a launch of `global_count` work-items.
pub fn group_count(global_count: usize, block_size: usize) -> usize {
    launch_width(global_count, block_size) / block_size
}

// `mult_step` and `strided_index` mirror `scan_gpu::step` and
// `scan_gpu::kernels`, which only build with the `cuda` feature. The
// `matches_kernel_crate` test keeps them in step.

pub struct MultStep {
    factor: usize,
    next: usize,
}

impl Iterator for MultStep {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.next;
        self.next = self.next.saturating_mul(self.factor);
        Some(next)
    }
}

// Returns an iterator that generates numbers by multiplying by the given
// factor. Saturates at `usize::MAX` instead of overflowing.
pub fn mult_step(init: usize, factor: usize) -> MultStep {
    MultStep { factor, next: init }
}

/// Periods at which a scan of `len` elements runs the calculate kernel, from
/// finest to coarsest. Every period but the last is also propagated.
pub fn scan_periods(len: usize, block_size: usize) -> impl Iterator<Item = usize> {
    mult_step(1, block_size)
        .take_while(move |&period| period <= len && (period == 1 || period < len))
}

/// Index of the element owned by work-item `item` at the given period.
pub fn strided_index(item: usize, period: usize, len: usize) -> Option<usize> {
    let i = (item + 1).checked_mul(period)? - 1;
    if i < len {
        Some(i)
    } else {
        None
    }
}
