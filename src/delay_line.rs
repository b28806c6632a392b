use crate::ModalCommand;

/// Slots per delay step
const OVERSIZE: usize = 5;

/// Ring buffer of the measurements waiting to be applied
///
/// The measurement of iteration `n` is kept at slot `n mod L`; the command applied at
/// iteration `n` is read from slot `(n - delay) mod L`, if that slot is valid.
#[derive(Debug, Clone)]
pub struct DelayLine {
    delay: usize,
    records: Vec<ModalCommand>,
    valid: Vec<bool>,
}
impl DelayLine {
    /// Creates a delay line for a latency of `delay` iterations and records of `n_modes` amplitudes
    ///
    /// All the slots start invalid.
    pub fn new(delay: usize, n_modes: usize) -> Self {
        let n = (delay + 1) * OVERSIZE;
        Self {
            delay,
            records: vec![ModalCommand::zeros(n_modes); n],
            valid: vec![false; n],
        }
    }
    pub fn delay(&self) -> usize {
        self.delay
    }
    pub fn len(&self) -> usize {
        self.records.len()
    }
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
    /// Slot of iteration `n - lag`, wrapped into `[0, L)`
    fn slot(&self, n: usize, lag: usize) -> usize {
        let l = self.len() as i64;
        (n as i64 - lag as i64).rem_euclid(l) as usize
    }
    pub fn invalidate_all(&mut self) {
        self.valid.iter_mut().for_each(|v| *v = false);
    }
    /// Stores the measurement of iteration `n`
    pub fn store(&mut self, n: usize, record: ModalCommand) {
        let k = self.slot(n, 0);
        self.records[k] = record;
        self.valid[k] = true;
    }
    /// Marks the slot of iteration `n` as invalid
    pub fn invalidate(&mut self, n: usize) {
        let k = self.slot(n, 0);
        self.valid[k] = false;
    }
    /// Returns the record to apply at iteration `n`, if any
    pub fn active(&self, n: usize) -> Option<&ModalCommand> {
        let k = self.slot(n, self.delay);
        if self.valid[k] {
            Some(&self.records[k])
        } else {
            None
        }
    }
}
