//! Per-transfer sampling decisions for the two streams

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::capture::frame::Stream;

/// Sampling divisors: a stream decodes on every Nth transfer, 0 disables it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRates {
    pub full: u32,
    pub proxy: u32,
}

impl SampleRates {
    pub fn divisor(&self, stream: Stream) -> u32 {
        match stream {
            Stream::Full => self.full,
            Stream::Proxy => self.proxy,
        }
    }
}

impl Default for SampleRates {
    fn default() -> Self {
        Self { full: 1, proxy: 0 }
    }
}

/// Outcome of one gate consultation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDecision {
    pub cycle: u64,
    pub full: bool,
    pub proxy: bool,
}

impl GateDecision {
    fn evaluate(rates: SampleRates, cycle: u64) -> Self {
        let due = |d: u32| d != 0 && cycle % u64::from(d) == 0;
        Self {
            cycle,
            full: due(rates.full),
            proxy: due(rates.proxy),
        }
    }

    pub fn decodes(&self, stream: Stream) -> bool {
        match stream {
            Stream::Full => self.full,
            Stream::Proxy => self.proxy,
        }
    }
}

pub struct SampleRateGate {
    rates: Mutex<SampleRates>,
    counter: AtomicU64,
}

impl SampleRateGate {
    pub fn new(rates: SampleRates) -> Self {
        Self {
            rates: Mutex::new(rates),
            counter: AtomicU64::new(0),
        }
    }

    /// Takes effect on the next transfer.
    pub fn set_rates(&self, rates: SampleRates) {
        *self.rates.lock() = rates;
    }

    pub fn rates(&self) -> SampleRates {
        *self.rates.lock()
    }

    pub fn is_enabled(&self, stream: Stream) -> bool {
        self.rates.lock().divisor(stream) != 0
    }

    /// Decide both streams for the current transfer and advance the counter.
    pub fn next_cycle(&self) -> GateDecision {
        let rates = *self.rates.lock();
        let cycle = self.counter.fetch_add(1, Ordering::Relaxed);
        GateDecision::evaluate(rates, cycle)
    }

    /// Transfers gated so far.
    pub fn cycles(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

impl Default for SampleRateGate {
    fn default() -> Self {
        Self::new(SampleRates::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(gate: &SampleRateGate, n: usize) -> Vec<(bool, bool)> {
        (0..n)
            .map(|_| {
                let d = gate.next_cycle();
                (d.full, d.proxy)
            })
            .collect()
    }

    #[test]
    fn default_decodes_full_only() {
        let gate = SampleRateGate::default();
        assert_eq!(pattern(&gate, 3), vec![(true, false); 3]);
        assert!(gate.is_enabled(Stream::Full));
        assert!(!gate.is_enabled(Stream::Proxy));
    }

    #[test]
    fn streams_are_gated_independently() {
        let gate = SampleRateGate::new(SampleRates { full: 3, proxy: 2 });
        assert_eq!(
            pattern(&gate, 6),
            vec![
                (true, true),
                (false, false),
                (false, true),
                (true, false),
                (false, true),
                (false, false),
            ]
        );
        assert_eq!(gate.cycles(), 6);
    }

    #[test]
    fn counter_advances_once_per_cycle_even_when_nothing_decodes() {
        let gate = SampleRateGate::new(SampleRates { full: 0, proxy: 0 });
        assert_eq!(pattern(&gate, 4), vec![(false, false); 4]);
        assert_eq!(gate.cycles(), 4);
    }

    #[test]
    fn reconfiguration_applies_to_next_cycle() {
        let gate = SampleRateGate::new(SampleRates { full: 1, proxy: 1 });
        assert_eq!(gate.next_cycle().cycle, 0);
        gate.set_rates(SampleRates { full: 0, proxy: 1 });
        let d = gate.next_cycle();
        assert_eq!((d.cycle, d.full, d.proxy), (1, false, true));
        assert!(!d.decodes(Stream::Full));
        assert_eq!(gate.rates(), SampleRates { full: 0, proxy: 1 });
    }
}
