//! Square 2-D FFTs on column-major buffers

use std::sync::Arc;

use rustfft::{num_complex::Complex64, Fft, FftPlanner};

/// Forward and inverse `n x n` transforms
///
/// Neither direction is normalized.
pub struct Fft2 {
    n: usize,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
    scratch: Vec<Complex64>,
}
impl Fft2 {
    pub fn new(n: usize) -> Self {
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(n);
        let inverse = planner.plan_fft_inverse(n);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());
        Self {
            n,
            forward,
            inverse,
            scratch: vec![Complex64::default(); scratch_len],
        }
    }
    pub fn size(&self) -> usize {
        self.n
    }
    pub fn forward(&mut self, data: &mut [Complex64]) {
        let fft = self.forward.clone();
        self.process(fft.as_ref(), data);
    }
    pub fn inverse(&mut self, data: &mut [Complex64]) {
        let fft = self.inverse.clone();
        self.process(fft.as_ref(), data);
    }
    fn process(&mut self, fft: &dyn Fft<f64>, data: &mut [Complex64]) {
        debug_assert_eq!(data.len(), self.n * self.n, "FFT buffer size mismatch");
        fft.process_with_scratch(data, &mut self.scratch);
        transpose(data, self.n);
        fft.process_with_scratch(data, &mut self.scratch);
        transpose(data, self.n);
    }
}

fn transpose(data: &mut [Complex64], n: usize) {
    for j in 0..n {
        for i in j + 1..n {
            data.swap(i + j * n, j + i * n);
        }
    }
}

/// Signed frequency index of FFT sample `k` for a transform of length `n`
pub fn frequency_index(k: usize, n: usize) -> f64 {
    if k < (n + 1) / 2 {
        k as f64
    } else {
        k as f64 - n as f64
    }
}

/// Swaps the quadrants of a column-major `n x n` buffer, moving the zero frequency to the center
pub fn fftshift<T: Copy>(data: &[T], n: usize) -> Vec<T> {
    let h = n / 2;
    (0..n * n)
        .map(|k| {
            let (i, j) = (k % n, k / n);
            data[(i + n - h) % n + ((j + n - h) % n) * n]
        })
        .collect()
}
