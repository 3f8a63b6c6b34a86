use crate::step::mult_step;
use cuda_std::{kernel, shared_array, thread};

/// Size of each of the two shared scratch arrays. The launch block size must
/// not exceed it; the host checks this before compiling the module.
pub const MAX_BLOCK_SIZE: usize = 1024;

/// Index of the element owned by work-item `item` when the array is viewed at
/// the given period, or `None` when the work-item falls past the end.
#[inline(always)]
pub fn strided_index(item: usize, period: usize, len: usize) -> Option<usize> {
    let i = (item + 1).checked_mul(period)? - 1;
    if i < len {
        Some(i)
    } else {
        None
    }
}

/// Inclusive scan of each block's `period`-strided elements, in place.
///
/// Work-item `j` owns element `(j + 1) * period - 1`, so the block with index
/// `b` scans the elements of `data[b * bd * period..(b + 1) * bd * period]`
/// that end a period. Uses the Hillis-Steele algorithm, double buffered
/// between two shared arrays so no lane reads a value that is being
/// overwritten in the same step.
#[kernel]
#[allow(improper_ctypes_definitions, clippy::missing_safety_doc)]
pub unsafe fn scan_hillis_steele_calculate(data: *mut f32, len: usize, period: usize) {
    let t_idx = thread::thread_idx_x() as usize;
    let b_idx = thread::block_idx_x() as usize;
    let b_dim = thread::block_dim_x() as usize;

    let front = shared_array![f32; MAX_BLOCK_SIZE];
    let back = shared_array![f32; MAX_BLOCK_SIZE];

    // Lanes past the end load the additive identity so they never disturb
    // the in-range lanes before them.
    let i = strided_index(b_idx * b_dim + t_idx, period, len);
    *(&mut *front.add(t_idx)) = match i {
        Some(i) => *data.add(i),
        None => 0.0,
    };

    let mut src = front;
    let mut dst = back;
    for stride in mult_step(1, 2).take_while(|&s| s < b_dim) {
        thread::sync_threads();

        let mut value = *src.add(t_idx);
        if t_idx >= stride {
            value += *src.add(t_idx - stride);
        }
        *(&mut *dst.add(t_idx)) = value;

        core::mem::swap(&mut src, &mut dst);
    }

    thread::sync_threads();
    if let Some(i) = i {
        *(&mut *data.add(i)) = *src.add(t_idx);
    }
}

/// Adds the total of all preceding blocks to every element of a block.
///
/// Expects the last element of each block to already hold its global
/// inclusive scan, which is the case once the next coarser period has been
/// fully scanned. Those elements are read as carries and never written.
#[kernel]
#[allow(improper_ctypes_definitions, clippy::missing_safety_doc)]
pub unsafe fn scan_hillis_steele_propagate(data: *mut f32, len: usize, period: usize) {
    let t_idx = thread::thread_idx_x() as usize;
    let b_idx = thread::block_idx_x() as usize;
    let b_dim = thread::block_dim_x() as usize;

    if b_idx == 0 || t_idx == b_dim - 1 {
        return;
    }

    if let Some(i) = strided_index(b_idx * b_dim + t_idx, period, len) {
        let carry = *data.add(b_idx * b_dim * period - 1);
        *(&mut *data.add(i)) += carry;
    }
}
