//! Background setpoint programs, at most one per device.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::registry::SharedDevice;
use crate::error::Result;
use crate::schedule::{ScheduleRunner, SetpointSchedule, SetpointSink, TICK_INTERVAL};
use crate::tracing::prelude::*;

/// Applies schedule targets through the device lock.
pub struct DeviceSink {
    device: SharedDevice,
}

#[async_trait]
impl SetpointSink for DeviceSink {
    async fn apply(&mut self, setpoint: f64) -> Result<()> {
        self.device.ensure_online()?;
        let mut chiller = self.device.chiller().lock().await;
        self.device.ensure_online()?;
        chiller.set_setpoint(setpoint).await
    }
}

// Progress is derived from the schedule and start time so status reads
// never wait on a ticker that is busy with the device.
struct Active {
    generation: u64,
    schedule: Arc<SetpointSchedule>,
    started: Instant,
    cancel: CancellationToken,
}

#[derive(Default)]
struct State {
    next_generation: u64,
    active: HashMap<String, Active>,
}

/// Runner table plus the ticker tasks driving it.
pub struct Schedules {
    state: Arc<Mutex<State>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl Default for Schedules {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }
}

impl Schedules {
    /// Start `schedule` on `device`, replacing whatever ran there before.
    pub fn load(&self, device: SharedDevice, schedule: SetpointSchedule) -> Value {
        let id = device.id().to_string();
        let summary = json!({
            "steps": schedule.steps().len(),
            "duration_minutes": schedule.duration_minutes(),
        });

        let snapshot = Arc::new(schedule.clone());
        let mut runner = ScheduleRunner::new(schedule, DeviceSink { device });
        runner.start();
        let started = runner.started_at().unwrap_or_else(Instant::now);
        let cancel = self.shutdown.child_token();

        let generation = {
            let mut state = self.state.lock();
            state.next_generation += 1;
            let generation = state.next_generation;
            let previous = state.active.insert(
                id.clone(),
                Active {
                    generation,
                    schedule: snapshot,
                    started,
                    cancel: cancel.clone(),
                },
            );
            if let Some(previous) = previous {
                info!(device = %id, "Replacing running schedule");
                previous.cancel.cancel();
            }
            generation
        };

        self.tasks
            .spawn(tick_loop(self.state.clone(), id, generation, runner, cancel));
        summary
    }

    /// Stop the device's schedule, if any.
    pub fn stop(&self, device_id: &str) -> bool {
        match self.state.lock().active.remove(device_id) {
            Some(active) => {
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// `{"running": false}` or the running schedule's progress.
    pub fn status(&self, device_id: &str) -> Value {
        let state = self.state.lock();
        let Some(active) = state.active.get(device_id) else {
            return json!({ "running": false });
        };
        let elapsed = active.started.elapsed().as_secs_f64() / 60.0;
        let p = active.schedule.progress_at(elapsed);
        json!({
            "running": true,
            "elapsed_minutes": round(p.elapsed_minutes, 1),
            "total_minutes": round(p.total_minutes, 1),
            "current_target": round(p.current_target, 2),
            "progress_pct": round(p.progress_pct, 1),
        })
    }

    pub fn is_running(&self, device_id: &str) -> bool {
        self.state.lock().active.contains_key(device_id)
    }

    /// Stop every schedule and wait for the tickers to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

async fn tick_loop(
    state: Arc<Mutex<State>>,
    id: String,
    generation: u64,
    mut runner: ScheduleRunner<DeviceSink>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            runner.stop();
            break;
        }

        let result = runner.tick().await.map(|target| (target, runner.is_finished()));
        match result {
            Ok((Some(_), false)) => {}
            Ok(_) => break,
            Err(e) => {
                error!(device = %id, error = %e, "Schedule tick failed, stopping schedule");
                runner.stop();
                break;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = time::sleep(TICK_INTERVAL) => {}
        }
    }

    // Only clear our own entry; a newer load may have replaced it.
    let mut state = state.lock();
    if state
        .active
        .get(&id)
        .is_some_and(|a| a.generation == generation)
    {
        state.active.remove(&id);
    }
}

fn round(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::SimulatedChiller;
    use crate::device::Chiller;
    use crate::schedule::ScheduleStep;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    async fn device() -> SharedDevice {
        let mut chiller = SimulatedChiller::default();
        chiller.connect().await.unwrap();
        SharedDevice::new("default", chiller)
    }

    fn ramp() -> SetpointSchedule {
        SetpointSchedule::new(vec![
            ScheduleStep {
                elapsed_minutes: 0.0,
                temperature: 20.0,
            },
            ScheduleStep {
                elapsed_minutes: 10.0,
                temperature: 30.0,
            },
        ])
        .unwrap()
    }

    async fn setpoint(device: &SharedDevice) -> f64 {
        device.chiller().lock().await.setpoint().await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_to_completion() {
        let schedules = Schedules::default();
        let device = device().await;
        let summary = schedules.load(device.clone(), ramp());
        assert_eq!(summary, json!({"steps": 2, "duration_minutes": 10.0}));

        time::sleep(Duration::from_secs(300)).await;
        let status = schedules.status("default");
        assert_eq!(status["running"], json!(true));
        assert!((setpoint(&device).await - 25.0).abs() < 0.1);

        time::sleep(Duration::from_secs(400)).await;
        assert!((setpoint(&device).await - 30.0).abs() <= 0.05);
        assert!(!schedules.is_running("default"));
        assert_eq!(schedules.status("default"), json!({"running": false}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop() {
        let schedules = Schedules::default();
        let device = device().await;
        schedules.load(device.clone(), ramp());
        time::sleep(Duration::from_secs(60)).await;

        assert!(schedules.stop("default"));
        assert!(!schedules.stop("default"));
        let frozen = setpoint(&device).await;
        time::sleep(Duration::from_secs(600)).await;
        assert_eq!(setpoint(&device).await, frozen);
        assert_eq!(schedules.status("default"), json!({"running": false}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_replaces_previous() {
        let schedules = Schedules::default();
        let device = device().await;
        schedules.load(device.clone(), ramp());
        time::sleep(Duration::from_secs(30)).await;

        let hold = SetpointSchedule::new(vec![
            ScheduleStep {
                elapsed_minutes: 0.0,
                temperature: 5.0,
            },
            ScheduleStep {
                elapsed_minutes: 60.0,
                temperature: 5.0,
            },
        ])
        .unwrap();
        schedules.load(device.clone(), hold);
        time::sleep(Duration::from_secs(120)).await;

        assert_eq!(setpoint(&device).await, 5.0);
        let status = schedules.status("default");
        assert_eq!(status["total_minutes"], json!(60.0));
        assert_eq!(status["current_target"], json!(5.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_failure_stops_schedule() {
        let schedules = Schedules::default();
        let mut chiller = SimulatedChiller::default();
        chiller.connect().await.unwrap();
        let fault = chiller.fault_switch();
        let device = SharedDevice::new("default", chiller);

        schedules.load(device, ramp());
        time::sleep(Duration::from_secs(10)).await;
        assert!(schedules.is_running("default"));

        fault.store(true, Ordering::SeqCst);
        time::sleep(Duration::from_secs(60)).await;
        assert!(!schedules.is_running("default"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_while_device_busy() {
        let schedules = Schedules::default();
        let device = device().await;
        let guard = device.chiller().lock().await;

        // The ticker is stuck behind the device lock mid-apply.
        schedules.load(device.clone(), ramp());
        time::sleep(Duration::from_secs(120)).await;

        let status = schedules.status("default");
        assert_eq!(status["running"], json!(true));
        assert_eq!(status["elapsed_minutes"], json!(2.0));
        assert_eq!(status["current_target"], json!(22.0));
        drop(guard);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_tickers() {
        let schedules = Schedules::default();
        schedules.load(device().await, ramp());
        schedules.shutdown().await;
        assert_eq!(schedules.status("default"), json!({"running": false}));
    }

    #[test]
    fn test_round() {
        assert_eq!(round(12.34, 1), 12.3);
        assert_eq!(round(12.346, 2), 12.35);
    }
}
