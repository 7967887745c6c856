//! Piecewise-linear setpoint programs.
//!
//! A [`SetpointSchedule`] is a list of `(elapsed_minutes, temperature)` steps.
//! Between steps the target is linearly interpolated; before the first and
//! after the last step it holds. A [`ScheduleRunner`] executes one schedule
//! against a [`SetpointSink`], applying a new setpoint only when the target
//! has moved by more than [`SETPOINT_TOLERANCE`].
//!
//! Schedules are stored as two-column CSV:
//!
//! ```text
//! elapsed_minutes,temperature_c
//! 0.00,20.00
//! 30.00,45.00
//! 90.00,45.00
//! ```

use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;

use crate::device::{validate_setpoint, SETPOINT_TOLERANCE};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// How often a background ticker should call [`ScheduleRunner::tick`].
pub const TICK_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleStep {
    pub elapsed_minutes: f64,
    pub temperature: f64,
}

/// Ordered, non-empty sequence of steps with strictly increasing times.
#[derive(Debug, Clone, PartialEq)]
pub struct SetpointSchedule {
    steps: Vec<ScheduleStep>,
}

impl SetpointSchedule {
    /// Build a schedule, sorting steps by time.
    ///
    /// Rejects empty input, negative or non-finite times, duplicate times,
    /// and temperatures outside the controller's range.
    pub fn new(mut steps: Vec<ScheduleStep>) -> Result<Self> {
        if steps.is_empty() {
            return Err(Error::Validation("No valid schedule steps found".into()));
        }
        for step in &steps {
            if !step.elapsed_minutes.is_finite() || step.elapsed_minutes < 0.0 {
                return Err(Error::Validation(format!(
                    "Invalid elapsed_minutes {} in schedule",
                    step.elapsed_minutes
                )));
            }
            validate_setpoint(step.temperature)?;
        }
        steps.sort_by(|a, b| a.elapsed_minutes.total_cmp(&b.elapsed_minutes));

        let mut duplicates: Vec<f64> = steps
            .windows(2)
            .filter(|w| w[0].elapsed_minutes == w[1].elapsed_minutes)
            .map(|w| w[0].elapsed_minutes)
            .collect();
        duplicates.dedup();
        if !duplicates.is_empty() {
            return Err(Error::Validation(format!(
                "Duplicate elapsed_minutes values in schedule: {duplicates:?}"
            )));
        }

        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[ScheduleStep] {
        &self.steps
    }

    fn first(&self) -> &ScheduleStep {
        &self.steps[0]
    }

    fn last(&self) -> &ScheduleStep {
        &self.steps[self.steps.len() - 1]
    }

    /// Time from the first to the last step.
    pub fn duration_minutes(&self) -> f64 {
        self.last().elapsed_minutes - self.first().elapsed_minutes
    }

    /// Elapsed time of the final step, i.e. when a runner finishes.
    pub fn end_minutes(&self) -> f64 {
        self.last().elapsed_minutes
    }

    /// Target temperature `elapsed_minutes` into the program.
    pub fn setpoint_at(&self, elapsed_minutes: f64) -> f64 {
        let first = self.first();
        let last = self.last();
        if elapsed_minutes <= first.elapsed_minutes {
            return first.temperature;
        }
        if elapsed_minutes >= last.elapsed_minutes {
            return last.temperature;
        }

        // First step strictly after `elapsed_minutes`; exists and is > 0 given
        // the hold checks above.
        let idx = self
            .steps
            .partition_point(|s| s.elapsed_minutes <= elapsed_minutes);
        let (a, b) = (&self.steps[idx - 1], &self.steps[idx]);
        let fraction = (elapsed_minutes - a.elapsed_minutes) / (b.elapsed_minutes - a.elapsed_minutes);
        a.temperature + fraction * (b.temperature - a.temperature)
    }

    /// Parse two-column CSV. A first row that does not parse as two numbers
    /// is taken as a header and skipped; anywhere else it is an error. Rows
    /// with fewer than two columns are ignored.
    pub fn from_reader<R: io::Read>(reader: R) -> Result<Self> {
        let mut csv = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut steps = Vec::new();
        for (i, record) in csv.records().enumerate() {
            let record = record?;
            if record.len() < 2 {
                continue;
            }
            let minutes = record[0].parse::<f64>();
            let temperature = record[1].parse::<f64>();
            match (minutes, temperature) {
                (Ok(elapsed_minutes), Ok(temperature)) => steps.push(ScheduleStep {
                    elapsed_minutes,
                    temperature,
                }),
                _ if i == 0 => continue,
                _ => {
                    return Err(Error::Validation(format!(
                        "Invalid schedule row {}: {:?}",
                        i + 1,
                        record.iter().collect::<Vec<_>>()
                    )))
                }
            }
        }
        Self::new(steps)
    }

    pub fn from_csv(text: &str) -> Result<Self> {
        Self::from_reader(text.as_bytes())
    }

    pub fn load_csv(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    /// Render as CSV with a header row and two-decimal values.
    pub fn to_csv(&self) -> Result<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(["elapsed_minutes", "temperature_c"])?;
        for step in &self.steps {
            writer.write_record([
                format!("{:.2}", step.elapsed_minutes),
                format!("{:.2}", step.temperature),
            ])?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| Error::Io(io::Error::other(e.to_string())))?;
        String::from_utf8(bytes).map_err(|e| Error::Io(io::Error::other(e)))
    }

    pub fn save_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_csv()?)?;
        Ok(())
    }
}

/// Receives setpoints computed by a [`ScheduleRunner`].
#[async_trait]
pub trait SetpointSink: Send {
    async fn apply(&mut self, setpoint: f64) -> Result<()>;
}

/// Progress report for a running schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleProgress {
    pub elapsed_minutes: f64,
    pub total_minutes: f64,
    pub current_target: f64,
    pub progress_pct: f64,
}

impl SetpointSchedule {
    /// Progress of a run that is `elapsed_minutes` in.
    pub fn progress_at(&self, elapsed_minutes: f64) -> ScheduleProgress {
        let total = self.duration_minutes();
        let progress_pct = if total > 0.0 {
            (elapsed_minutes / total * 100.0).min(100.0)
        } else {
            100.0
        };
        ScheduleProgress {
            elapsed_minutes,
            total_minutes: total,
            current_target: self.setpoint_at(elapsed_minutes),
            progress_pct,
        }
    }
}

/// Executes a schedule in real time.
pub struct ScheduleRunner<S> {
    schedule: SetpointSchedule,
    sink: S,
    started: Option<Instant>,
    finished: bool,
    last_applied: Option<f64>,
}

impl<S: SetpointSink> ScheduleRunner<S> {
    pub fn new(schedule: SetpointSchedule, sink: S) -> Self {
        Self {
            schedule,
            sink,
            started: None,
            finished: false,
            last_applied: None,
        }
    }

    pub fn schedule(&self) -> &SetpointSchedule {
        &self.schedule
    }

    /// Begin (or restart) the program from now.
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
        self.finished = false;
        self.last_applied = None;
        info!(steps = self.schedule.steps().len(), "Schedule started");
    }

    /// Stop without applying anything further.
    pub fn stop(&mut self) {
        if !self.finished {
            self.finished = true;
            info!("Schedule stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some() && !self.finished
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn last_applied(&self) -> Option<f64> {
        self.last_applied
    }

    pub fn elapsed_minutes(&self) -> f64 {
        self.started
            .map(|t| t.elapsed().as_secs_f64() / 60.0)
            .unwrap_or(0.0)
    }

    /// When [`start`](Self::start) was last called.
    pub fn started_at(&self) -> Option<Instant> {
        self.started
    }

    pub fn progress(&self) -> Option<ScheduleProgress> {
        if !self.is_running() {
            return None;
        }
        Some(self.schedule.progress_at(self.elapsed_minutes()))
    }

    /// Apply the current target if it moved; finish at the last step.
    ///
    /// Returns the target, or `None` when not running. A sink error leaves
    /// the runner's state untouched so the next tick retries.
    pub async fn tick(&mut self) -> Result<Option<f64>> {
        if !self.is_running() {
            return Ok(None);
        }

        let elapsed = self.elapsed_minutes();
        let target = self.schedule.setpoint_at(elapsed);
        let changed = self
            .last_applied
            .map_or(true, |last| (target - last).abs() > SETPOINT_TOLERANCE);

        if changed {
            self.sink.apply(target).await?;
            self.last_applied = Some(target);
            debug!(target, elapsed_minutes = elapsed, "Schedule setpoint applied");
        }

        if elapsed >= self.schedule.end_minutes() {
            self.finished = true;
            info!(target, "Schedule finished");
        }
        Ok(Some(target))
    }
}
