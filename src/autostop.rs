// src/autostop.rs
//! Cancellable timer that stops a test after a fixed duration.
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use log::{debug, info};
use crate::engine::AcquisitionEngine;

/// Pending stop request for one run.
///
/// Fires `request_stop` for the run it was armed for; if that run already
/// ended, or a new one started, the request is ignored by the engine.
/// Dropping the timer cancels it.
pub struct AutoStop {
    run_id: u64,
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<bool>>,
}

impl AutoStop {
    pub fn arm(engine: AcquisitionEngine, run_id: u64, after: Duration) -> Self {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let handle = thread::spawn(move || match cancelled.recv_timeout(after) {
            Err(RecvTimeoutError::Timeout) => {
                let fired = engine.request_stop(run_id);
                if fired {
                    info!("Auto-stop after {:.1} s for test {run_id}", after.as_secs_f64());
                }
                fired
            }
            _ => {
                debug!("Auto-stop for test {run_id} cancelled");
                false
            }
        });
        Self {
            run_id,
            cancel: Some(cancel),
            handle: Some(handle),
        }
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn is_pending(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Cancels the timer; returns whether it had already fired.
    pub fn cancel(&mut self) -> bool {
        drop(self.cancel.take());
        self.handle
            .take()
            .map(|h| h.join().unwrap_or(false))
            .unwrap_or(false)
    }
}

impl Drop for AutoStop {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::ScriptedDevice;
    use crate::engine::Participant;
    use crate::types::{EngineState, Reading, SensorId, SensorKind};
    use std::time::Instant;

    fn start(engine: &AcquisitionEngine) -> u64 {
        let participant = Participant {
            sensor: SensorId(0),
            name: "LC".into(),
            kind: SensorKind::Loadcell,
            device: Box::new(ScriptedDevice::constant("LC", Reading::Scalar(1.0))),
        };
        engine
            .test_start(vec![participant], Duration::from_millis(5))
            .unwrap()
    }

    #[test]
    fn fires_after_duration() {
        let engine = AcquisitionEngine::new();
        let run = start(&engine);
        let mut timer = AutoStop::arm(engine.clone(), run, Duration::from_millis(30));
        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.state() != EngineState::Stopping {
            assert!(Instant::now() < deadline, "auto-stop never fired");
            thread::sleep(Duration::from_millis(2));
        }
        // already fired
        assert!(timer.cancel());
        let finished = engine.test_stop().unwrap();
        assert!(finished.test.len() >= 1);
    }

    #[test]
    fn cancelled_timer_leaves_test_running() {
        let engine = AcquisitionEngine::new();
        let run = start(&engine);
        let mut timer = AutoStop::arm(engine.clone(), run, Duration::from_millis(30));
        assert!(!timer.cancel());
        thread::sleep(Duration::from_millis(60));
        assert!(engine.is_recording());
        engine.test_stop().unwrap();
    }

    #[test]
    fn timer_for_an_old_run_does_nothing() {
        let engine = AcquisitionEngine::new();
        let old = start(&engine);
        engine.test_stop().unwrap();
        let _new = start(&engine);
        let mut timer = AutoStop::arm(engine.clone(), old, Duration::from_millis(5));
        thread::sleep(Duration::from_millis(30));
        assert!(!timer.cancel());
        assert!(engine.is_recording());
        engine.test_stop().unwrap();
    }
}
