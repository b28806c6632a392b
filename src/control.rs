//! # Command filters
//!
//! Discrete-time controllers ([Control]) and the [CommandFilter]s that turn the delayed
//! modal measurements into mirror commands.

use crate::ModalCommand;

pub trait Control {
    fn step(&mut self, value: &[f64]) -> Option<Vec<f64>>;
}

/// Maps a delayed measurement to a mirror command
pub trait CommandFilter {
    /// Resets the filter state for `n_modes` modes
    fn initialize(&mut self, n_modes: usize);
    /// Writes into `output` the command for measurement `input` at iteration `iteration`
    fn filter_commands(&mut self, output: &mut ModalCommand, input: &ModalCommand, iteration: usize);
}

#[derive(Default)]
pub struct Average {
    n_sample: usize,
    average: Vec<f64>,
    counter: usize,
}
impl Average {
    pub fn new(n_sample: usize, n_data: usize) -> Self {
        Self {
            n_sample: n_sample.max(1),
            average: vec![0f64; n_data],
            counter: 0,
        }
    }
    pub fn n_sample(&self) -> usize {
        self.n_sample
    }
    /// Discards the samples accumulated so far
    pub fn reset(&mut self) {
        self.average.iter_mut().for_each(|a| *a = 0f64);
        self.counter = 0;
    }
}
impl Iterator for Average {
    type Item = Vec<f64>;
    fn next(&mut self) -> Option<Self::Item> {
        self.counter += 1;
        if self.counter == self.n_sample {
            let n = self.n_sample as f64;
            let mean: Vec<_> = self.average.iter().map(|x| x / n).collect();
            self.reset();
            Some(mean)
        } else {
            None
        }
    }
}
impl Control for Average {
    fn step(&mut self, value: &[f64]) -> Option<Vec<f64>> {
        self.average.iter_mut().zip(value).for_each(|(a, v)| {
            *a += *v;
        });
        self.next()
    }
}

/// Passes the measurement through unchanged
#[derive(Default, Debug, Clone, Copy)]
pub struct Identity;
impl CommandFilter for Identity {
    fn initialize(&mut self, _n_modes: usize) {}
    fn filter_commands(&mut self, output: &mut ModalCommand, input: &ModalCommand, iteration: usize) {
        output.amplitudes.clone_from(&input.amplitudes);
        output.iteration = iteration;
    }
}

/// Leaky integrator: `y[n] = leak y[n-1] + gain u[n]`
#[derive(Default)]
pub struct Integrate {
    gain: f64,
    leak: f64,
    mem: Vec<f64>,
}
impl Integrate {
    pub fn new(gain: f64, n_data: usize) -> Self {
        Self {
            gain,
            leak: 1f64,
            mem: vec![0f64; n_data],
        }
    }
    /// Sets the integrator leak, 1 for a pure integrator
    pub fn leak(self, leak: f64) -> Self {
        Self { leak, ..self }
    }
    pub fn last(&self) -> Option<Vec<f64>> {
        Some(self.mem.clone())
    }
}
impl Control for Integrate {
    fn step(&mut self, value: &[f64]) -> Option<Vec<f64>> {
        let (gain, leak) = (self.gain, self.leak);
        self.mem.iter_mut().zip(value).for_each(|(a, v)| {
            *a = leak * *a + *v * gain;
        });
        self.last()
    }
}
impl CommandFilter for Integrate {
    fn initialize(&mut self, n_modes: usize) {
        self.mem = vec![0f64; n_modes];
    }
    fn filter_commands(&mut self, output: &mut ModalCommand, input: &ModalCommand, iteration: usize) {
        if let Some(y) = self.step(&input.amplitudes) {
            output.amplitudes = y;
        }
        output.iteration = iteration;
    }
}

#[derive(Default)]
pub struct Proportional {
    gain: f64,
    mem: Vec<f64>,
}
impl Proportional {
    pub fn new(gain: f64, n_data: usize) -> Self {
        Self {
            gain,
            mem: vec![0f64; n_data],
        }
    }
    pub fn last(&self) -> Option<Vec<f64>> {
        Some(self.mem.clone())
    }
}
impl Control for Proportional {
    fn step(&mut self, value: &[f64]) -> Option<Vec<f64>> {
        let gain = self.gain;
        self.mem.iter_mut().zip(value).for_each(|(a, v)| {
            *a = *v * gain;
        });
        self.last()
    }
}
impl CommandFilter for Proportional {
    fn initialize(&mut self, n_modes: usize) {
        self.mem = vec![0f64; n_modes];
    }
    fn filter_commands(&mut self, output: &mut ModalCommand, input: &ModalCommand, iteration: usize) {
        if let Some(y) = self.step(&input.amplitudes) {
            output.amplitudes = y;
        }
        output.iteration = iteration;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(amplitudes: Vec<f64>) -> ModalCommand {
        ModalCommand {
            amplitudes,
            iteration: 3,
        }
    }

    #[test]
    fn average() {
        let mut avrg = Average::new(3, 2);
        assert!(avrg.step(&[1., 2.]).is_none());
        assert!(avrg.step(&[2., 4.]).is_none());
        assert_eq!(avrg.step(&[3., 6.]), Some(vec![2., 4.]));
        assert!(avrg.step(&[1., 1.]).is_none());
    }

    #[test]
    fn identity() {
        let mut output = ModalCommand::default();
        Identity.filter_commands(&mut output, &command(vec![1., -1.]), 5);
        assert_eq!(output.amplitudes, vec![1., -1.]);
        assert_eq!(output.iteration, 5);
    }

    #[test]
    fn integrate() {
        let mut filter = Integrate::new(0.5, 0);
        filter.initialize(2);
        let mut output = ModalCommand::default();
        filter.filter_commands(&mut output, &command(vec![1., 2.]), 0);
        filter.filter_commands(&mut output, &command(vec![1., 2.]), 1);
        assert_eq!(output.amplitudes, vec![1., 2.]);
    }

    #[test]
    fn leaky_integrate() {
        let mut filter = Integrate::new(1., 1).leak(0.5);
        assert_eq!(filter.step(&[2.]), Some(vec![2.]));
        assert_eq!(filter.step(&[0.]), Some(vec![1.]));
    }

    #[test]
    fn proportional() {
        let mut filter = Proportional::new(0.1, 2);
        let mut output = ModalCommand::default();
        filter.filter_commands(&mut output, &command(vec![10., 20.]), 1);
        assert_eq!(output.amplitudes, vec![1., 2.]);
    }
}
