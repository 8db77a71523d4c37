//! Phase timing for the training loop
//!
//! One iteration walks `Idle -> Encoding -> Forward -> Backward ->
//! OptimizerUpdate` and closes with `end_iter`. Each mark closes the
//! previous phase. Marks out of that order are a programming error and fail
//! with [`Error::PhaseOrder`] instead of recording garbage durations.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::info;

use crate::config::PerfConfig;
use crate::metrics::MetricsSink;
use crate::{Error, Result};

/// Phases of one training iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Encoding,
    Forward,
    Backward,
    OptimizerUpdate,
}

impl Phase {
    /// Phase that must precede this one
    fn predecessor(self) -> Option<Phase> {
        match self {
            Phase::Idle => None,
            Phase::Encoding => Some(Phase::Idle),
            Phase::Forward => Some(Phase::Encoding),
            Phase::Backward => Some(Phase::Forward),
            Phase::OptimizerUpdate => Some(Phase::Backward),
        }
    }

    /// Slot in per-iteration duration arrays (`Idle` is not timed)
    fn slot(self) -> Option<usize> {
        match self {
            Phase::Idle => None,
            Phase::Encoding => Some(0),
            Phase::Forward => Some(1),
            Phase::Backward => Some(2),
            Phase::OptimizerUpdate => Some(3),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Encoding => "encoding",
            Phase::Forward => "forward",
            Phase::Backward => "backward",
            Phase::OptimizerUpdate => "optimizer_update",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy)]
struct IterationSample {
    phases: [Duration; 4],
    total: Duration,
    work_units: u64,
}

/// Aggregated timings over the reporting window
#[derive(Debug, Clone, PartialEq)]
pub struct PerfReport {
    /// Iterations in the window
    pub iterations: usize,
    pub encoding: Duration,
    pub forward: Duration,
    pub backward: Duration,
    pub optimizer_update: Duration,
    /// Mean wall time of one whole iteration
    pub iteration: Duration,
    pub units_per_sec: f64,
    pub param_touches_per_sec: f64,
}

impl PerfReport {
    /// Push the report into a metrics sink under `perf/` tags
    pub fn emit(&self, sink: &dyn MetricsSink, step: u64) {
        sink.record_scalar("perf/encoding_secs", self.encoding.as_secs_f64(), step);
        sink.record_scalar("perf/forward_secs", self.forward.as_secs_f64(), step);
        sink.record_scalar("perf/backward_secs", self.backward.as_secs_f64(), step);
        sink.record_scalar(
            "perf/optimizer_update_secs",
            self.optimizer_update.as_secs_f64(),
            step,
        );
        sink.record_scalar("perf/iteration_secs", self.iteration.as_secs_f64(), step);
        sink.record_scalar("perf/units_per_sec", self.units_per_sec, step);
        sink.record_scalar("perf/param_touches_per_sec", self.param_touches_per_sec, step);
    }
}

/// Phase state machine plus a sliding window of completed iterations
#[derive(Debug)]
pub struct PerformanceInstrumentor {
    config: PerfConfig,
    /// Parameters touched by one work unit
    num_parameters: u64,
    phase: Phase,
    phase_started: Option<Instant>,
    iter_started: Option<Instant>,
    current: [Duration; 4],
    window: VecDeque<IterationSample>,
    completed: usize,
}

impl PerformanceInstrumentor {
    pub fn new(config: PerfConfig, num_parameters: u64) -> Self {
        let capacity = config.window;
        Self {
            config,
            num_parameters,
            phase: Phase::Idle,
            phase_started: None,
            iter_started: None,
            current: [Duration::ZERO; 4],
            window: VecDeque::with_capacity(capacity),
            completed: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Iterations completed since the fit started, warm-up included
    pub fn completed_iterations(&self) -> usize {
        self.completed
    }

    /// Forget everything recorded so far
    pub fn on_fit_start(&mut self) {
        self.window.clear();
        self.completed = 0;
        self.phase = Phase::Idle;
        self.phase_started = None;
        self.iter_started = None;
    }

    /// Begin an iteration, discarding any partially timed one
    pub fn start_new_iter(&mut self) {
        self.start_new_iter_at(Instant::now());
    }

    pub fn before_encode(&mut self) -> Result<()> {
        self.enter(Phase::Encoding, Instant::now())
    }

    pub fn before_forward(&mut self) -> Result<()> {
        self.enter(Phase::Forward, Instant::now())
    }

    pub fn before_backward(&mut self) -> Result<()> {
        self.enter(Phase::Backward, Instant::now())
    }

    pub fn before_optimizer_update(&mut self) -> Result<()> {
        self.enter(Phase::OptimizerUpdate, Instant::now())
    }

    /// Close the iteration that processed `work_units` units
    pub fn end_iter(&mut self, work_units: u64) -> Result<()> {
        self.end_iter_at(work_units, Instant::now())
    }

    /// Aggregate the window, `None` until one post-warm-up iteration exists
    pub fn report(&self) -> Option<PerfReport> {
        if self.window.is_empty() {
            return None;
        }

        let n = self.window.len() as u32;
        let mut phase_sums = [Duration::ZERO; 4];
        let mut total = Duration::ZERO;
        let mut units = 0u64;
        for sample in &self.window {
            for (sum, d) in phase_sums.iter_mut().zip(sample.phases) {
                *sum += d;
            }
            total += sample.total;
            units += sample.work_units;
        }

        let secs = total.as_secs_f64();
        let units_per_sec = if secs > 0.0 { units as f64 / secs } else { 0.0 };

        Some(PerfReport {
            iterations: self.window.len(),
            encoding: phase_sums[0] / n,
            forward: phase_sums[1] / n,
            backward: phase_sums[2] / n,
            optimizer_update: phase_sums[3] / n,
            iteration: total / n,
            units_per_sec,
            param_touches_per_sec: units_per_sec * self.num_parameters as f64,
        })
    }

    /// Log the final report and push it to `sink`
    pub fn on_fit_end(&mut self, sink: &dyn MetricsSink, step: u64) -> Option<PerfReport> {
        let report = self.report()?;
        info!(
            iterations = report.iterations,
            encoding_ms = report.encoding.as_secs_f64() * 1e3,
            forward_ms = report.forward.as_secs_f64() * 1e3,
            backward_ms = report.backward.as_secs_f64() * 1e3,
            optimizer_update_ms = report.optimizer_update.as_secs_f64() * 1e3,
            iteration_ms = report.iteration.as_secs_f64() * 1e3,
            units_per_sec = report.units_per_sec,
            param_touches_per_sec = report.param_touches_per_sec,
            "Performance summary"
        );
        report.emit(sink, step);
        Some(report)
    }

    fn start_new_iter_at(&mut self, now: Instant) {
        self.phase = Phase::Idle;
        self.phase_started = Some(now);
        self.iter_started = Some(now);
        self.current = [Duration::ZERO; 4];
    }

    fn enter(&mut self, next: Phase, now: Instant) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let expected = next.predecessor().unwrap_or(Phase::Idle);
        if self.phase != expected || self.iter_started.is_none() {
            return Err(Error::PhaseOrder {
                expected: format!("{} before {}", expected, next),
                actual: self.describe_current(),
            });
        }

        self.close_phase(now)?;
        self.phase = next;
        self.phase_started = Some(now);
        Ok(())
    }

    fn end_iter_at(&mut self, work_units: u64, now: Instant) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let started = match (self.phase, self.iter_started) {
            (Phase::OptimizerUpdate, Some(started)) => started,
            _ => {
                return Err(Error::PhaseOrder {
                    expected: format!("{} before end_iter", Phase::OptimizerUpdate),
                    actual: self.describe_current(),
                })
            }
        };

        self.close_phase(now)?;
        let sample = IterationSample {
            phases: self.current,
            total: now.saturating_duration_since(started),
            work_units,
        };

        self.completed += 1;
        if self.completed > self.config.warmup_iters {
            if self.window.len() == self.config.window {
                self.window.pop_front();
            }
            self.window.push_back(sample);
        }

        self.phase = Phase::Idle;
        self.phase_started = None;
        self.iter_started = None;
        Ok(())
    }

    fn close_phase(&mut self, now: Instant) -> Result<()> {
        let started = self.phase_started.ok_or_else(|| Error::PhaseOrder {
            expected: "start_new_iter".to_string(),
            actual: self.describe_current(),
        })?;
        if now < started {
            return Err(Error::PhaseOrder {
                expected: format!("timestamp after {} started", self.phase),
                actual: "earlier timestamp".to_string(),
            });
        }
        if let Some(slot) = self.phase.slot() {
            self.current[slot] += now - started;
        }
        Ok(())
    }

    fn describe_current(&self) -> String {
        if self.iter_started.is_none() {
            "no iteration started".to_string()
        } else {
            format!("currently in {}", self.phase)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MemorySink;

    fn config(window: usize, warmup_iters: usize) -> PerfConfig {
        PerfConfig {
            enabled: true,
            window,
            warmup_iters,
        }
    }

    /// Run one iteration where every phase takes `ms` milliseconds
    fn iteration(perf: &mut PerformanceInstrumentor, t0: Instant, ms: u64, units: u64) -> Instant {
        let step = Duration::from_millis(ms);
        perf.start_new_iter_at(t0);
        perf.enter(Phase::Encoding, t0).unwrap();
        perf.enter(Phase::Forward, t0 + step).unwrap();
        perf.enter(Phase::Backward, t0 + step * 2).unwrap();
        perf.enter(Phase::OptimizerUpdate, t0 + step * 3).unwrap();
        perf.end_iter_at(units, t0 + step * 4).unwrap();
        t0 + step * 4
    }

    #[test]
    fn test_phase_means_and_throughput() {
        let mut perf = PerformanceInstrumentor::new(config(10, 0), 1_000);
        let mut t = Instant::now();
        t = iteration(&mut perf, t, 10, 4);
        iteration(&mut perf, t, 30, 4);

        let report = perf.report().unwrap();
        assert_eq!(report.iterations, 2);
        assert_eq!(report.forward, Duration::from_millis(20));
        assert_eq!(report.iteration, Duration::from_millis(80));
        // 8 units over 160ms
        assert!((report.units_per_sec - 50.0).abs() < 1e-9);
        assert!((report.param_touches_per_sec - 50_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_warmup_iterations_are_ignored() {
        let mut perf = PerformanceInstrumentor::new(config(10, 2), 1);
        let mut t = Instant::now();
        t = iteration(&mut perf, t, 100, 1);
        t = iteration(&mut perf, t, 100, 1);
        assert!(perf.report().is_none());

        iteration(&mut perf, t, 5, 1);
        let report = perf.report().unwrap();
        assert_eq!(report.iterations, 1);
        assert_eq!(report.encoding, Duration::from_millis(5));
        assert_eq!(perf.completed_iterations(), 3);
    }

    #[test]
    fn test_window_slides() {
        let mut perf = PerformanceInstrumentor::new(config(2, 0), 1);
        let mut t = Instant::now();
        for ms in [100, 1, 3] {
            t = iteration(&mut perf, t, ms, 1);
        }
        let report = perf.report().unwrap();
        assert_eq!(report.iterations, 2);
        assert_eq!(report.backward, Duration::from_millis(2));
    }

    #[test]
    fn test_out_of_order_marks_fail() {
        let mut perf = PerformanceInstrumentor::new(config(10, 0), 1);

        // No iteration started
        assert!(matches!(
            perf.before_encode(),
            Err(Error::PhaseOrder { .. })
        ));

        perf.start_new_iter();
        perf.before_encode().unwrap();
        let err = perf.before_backward().unwrap_err();
        assert!(matches!(err, Error::PhaseOrder { .. }));
        assert!(err.to_string().contains("forward before backward"));

        assert!(perf.end_iter(1).is_err());
        assert_eq!(perf.phase(), Phase::Encoding);
    }

    #[test]
    fn test_start_new_iter_resets_from_any_phase() {
        let mut perf = PerformanceInstrumentor::new(config(10, 0), 1);
        perf.start_new_iter();
        perf.before_encode().unwrap();
        perf.before_forward().unwrap();

        perf.start_new_iter();
        assert_eq!(perf.phase(), Phase::Idle);
        perf.before_encode().unwrap();
    }

    #[test]
    fn test_disabled_instrumentor_accepts_anything() {
        let mut perf = PerformanceInstrumentor::new(
            PerfConfig {
                enabled: false,
                ..config(10, 0)
            },
            1,
        );
        perf.before_backward().unwrap();
        perf.end_iter(3).unwrap();
        assert!(perf.report().is_none());
    }

    #[test]
    fn test_fit_end_emits_perf_tags() {
        let mut perf = PerformanceInstrumentor::new(config(10, 0), 2);
        iteration(&mut perf, Instant::now(), 10, 2);

        let sink = MemorySink::new();
        perf.on_fit_end(&sink, 7).unwrap();
        let units = sink.series("perf/units_per_sec");
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].0, 7);
        assert!((units[0].1 - 50.0).abs() < 1e-9);
    }
}
