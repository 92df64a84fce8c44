// src/engine.rs
//! Lockstep acquisition: one sampling thread per sensor, one coordinator.
//!
//! The coordinator owns the tick clock and the `Test` being recorded. It
//! talks to the sampling threads only through the [`TickBarrier`] and to
//! the caller through an `EngineCommand` channel, so the state machine is
//! the only thing the public methods need to lock.
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use log::{debug, error, info, warn};
use crate::barrier::{Tick, TickBarrier};
use crate::drivers::SensorDevice;
use crate::error::ForceError;
use crate::tare::TareWindow;
use crate::types::{EngineState, Reading, SensorId, SensorKind, TestStatus};

/// How long `test_stop` waits for the sampling threads to hand their devices back.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const POLL: Duration = Duration::from_millis(20);

/// A sensor lent to the engine for one test.
pub struct Participant {
    pub sensor: SensorId,
    pub name: String,
    pub kind: SensorKind,
    pub device: Box<dyn SensorDevice>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorSequence {
    pub sensor: SensorId,
    pub name: String,
    pub kind: SensorKind,
    pub values: Vec<Reading>,
    /// First tick padded with a sentinel after a read failure.
    pub faulted_at: Option<usize>,
}

/// One acquisition run: timestamps in ms since the epoch and one value per
/// sensor per timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Test {
    pub timestamps: Vec<u64>,
    pub sequences: Vec<SensorSequence>,
}

impl Test {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn sequence(&self, sensor: SensorId) -> Option<&SensorSequence> {
        self.sequences.iter().find(|s| s.sensor == sensor)
    }
}

/// What `test_stop` hands back to the owner of the sensors.
pub struct FinishedRun {
    pub test: Test,
    pub devices: Vec<(SensorId, Box<dyn SensorDevice>)>,
    /// Sensors whose reads failed during the test.
    pub faulted: Vec<SensorId>,
    /// Sensors whose threads did not join in time; their devices are gone.
    pub lost: Vec<SensorId>,
}

enum EngineCommand {
    Stop,
    Tare {
        amount: usize,
        interval: Duration,
        reply: Sender<Result<Vec<TareWindow>, ForceError>>,
    },
}

struct WorkerExit {
    slot: usize,
    device: Box<dyn SensorDevice>,
    faulted: bool,
}

struct Run {
    id: u64,
    sensors: Vec<(SensorId, String)>,
    stop: Arc<AtomicBool>,
    commands: Sender<EngineCommand>,
    barrier: Arc<TickBarrier>,
    coordinator: JoinHandle<Test>,
    workers: Vec<JoinHandle<()>>,
    exits: Receiver<WorkerExit>,
}

#[derive(Default)]
struct Timing {
    started: Option<Instant>,
    finished: Option<Instant>,
}

struct Shared {
    state: Arc<Mutex<EngineState>>,
    samples: Arc<AtomicUsize>,
    faults: Arc<Mutex<Vec<SensorId>>>,
    run: Mutex<Option<Run>>,
    run_id: AtomicU64,
    timing: Mutex<Timing>,
    join_timeout: Duration,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let run = self
            .run
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(run) = run {
            run.stop.store(true, Ordering::SeqCst);
            run.barrier.shutdown();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Handle to the acquisition state machine; clones share the same engine.
#[derive(Clone)]
pub struct AcquisitionEngine {
    shared: Arc<Shared>,
}

impl Default for AcquisitionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AcquisitionEngine {
    pub fn new() -> Self {
        Self::with_join_timeout(JOIN_TIMEOUT)
    }

    pub fn with_join_timeout(join_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Arc::new(Mutex::new(EngineState::Idle)),
                samples: Arc::new(AtomicUsize::new(0)),
                faults: Arc::new(Mutex::new(Vec::new())),
                run: Mutex::new(None),
                run_id: AtomicU64::new(0),
                timing: Mutex::new(Timing::default()),
                join_timeout,
            }),
        }
    }

    pub fn state(&self) -> EngineState {
        *lock(&self.shared.state)
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state(), EngineState::Recording | EngineState::Taring)
    }

    /// Identifier of the running test, if any.
    pub fn current_run(&self) -> Option<u64> {
        lock(&self.shared.run).as_ref().map(|run| run.id)
    }

    /// Sensors whose reads failed in the running (or last) test, in failure order.
    pub fn faulted_sensors(&self) -> Vec<SensorId> {
        lock(&self.shared.faults).clone()
    }

    pub fn status(&self) -> TestStatus {
        let recording = self.is_recording();
        let faulted = lock(&self.shared.faults).len();
        let timing = lock(&self.shared.timing);
        let elapsed = match (timing.started, timing.finished) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        };
        TestStatus {
            recording,
            samples: self.shared.samples.load(Ordering::SeqCst),
            faulted,
            elapsed,
        }
    }

    /// Launches one sampling thread per participant and the tick coordinator.
    pub fn test_start(
        &self,
        participants: Vec<Participant>,
        interval: Duration,
    ) -> Result<u64, ForceError> {
        let mut state = lock(&self.shared.state);
        if *state != EngineState::Idle {
            return Err(ForceError::Precondition(format!(
                "cannot start a test while {:?}",
                *state
            )));
        }
        if participants.is_empty() {
            return Err(ForceError::Precondition(
                "no sensor is available for acquisition".into(),
            ));
        }
        let kinds: Vec<SensorKind> = participants.iter().map(|p| p.kind).collect();
        let barrier = Arc::new(TickBarrier::new(kinds));
        let stop = Arc::new(AtomicBool::new(false));
        let (exit_tx, exits) = mpsc::channel();
        let (commands, command_rx) = mpsc::channel();
        lock(&self.shared.faults).clear();

        let mut sensors = Vec::with_capacity(participants.len());
        let mut sequences = Vec::with_capacity(participants.len());
        let mut workers = Vec::with_capacity(participants.len());
        for (slot, participant) in participants.into_iter().enumerate() {
            sensors.push((participant.sensor, participant.name.clone()));
            sequences.push(SensorSequence {
                sensor: participant.sensor,
                name: participant.name.clone(),
                kind: participant.kind,
                values: Vec::new(),
                faulted_at: None,
            });
            let barrier = Arc::clone(&barrier);
            let exit_tx = exit_tx.clone();
            let faults = Arc::clone(&self.shared.faults);
            workers.push(thread::spawn(move || {
                sample_loop(slot, participant, &barrier, &exit_tx, &faults);
            }));
        }

        let id = self.shared.run_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.samples.store(0, Ordering::SeqCst);
        *lock(&self.shared.timing) = Timing {
            started: Some(Instant::now()),
            finished: None,
        };
        let coordinator = Coordinator {
            interval,
            barrier: Arc::clone(&barrier),
            stop: Arc::clone(&stop),
            commands: command_rx,
            state: Arc::clone(&self.shared.state),
            samples: Arc::clone(&self.shared.samples),
            test: Test {
                timestamps: Vec::new(),
                sequences,
            },
        };
        let coordinator = thread::spawn(move || coordinator.run());
        info!(
            "Test {id} started: {} sensors every {} ms",
            sensors.len(),
            interval.as_millis()
        );
        *lock(&self.shared.run) = Some(Run {
            id,
            sensors,
            stop,
            commands,
            barrier,
            coordinator,
            workers,
            exits,
        });
        *state = EngineState::Recording;
        Ok(id)
    }

    /// Samples calibrated sensors for `amount` ticks while the test pauses.
    ///
    /// Blocks until the window is complete. Values go to the returned
    /// windows, never into the running test.
    pub fn tare(&self, amount: usize, interval: Duration) -> Result<Vec<TareWindow>, ForceError> {
        if amount == 0 {
            return Err(ForceError::Configuration("tare needs at least one sample".into()));
        }
        let commands = {
            let state = lock(&self.shared.state);
            if *state != EngineState::Recording {
                return Err(ForceError::Precondition(format!(
                    "tare requires a recording test, engine is {:?}",
                    *state
                )));
            }
            match lock(&self.shared.run).as_ref() {
                Some(run) => run.commands.clone(),
                None => return Err(ForceError::Precondition("no test is running".into())),
            }
        };
        let (reply, response) = mpsc::channel();
        commands
            .send(EngineCommand::Tare {
                amount,
                interval,
                reply,
            })
            .map_err(|_| ForceError::Precondition("acquisition loop has exited".into()))?;
        response
            .recv()
            .map_err(|_| ForceError::Precondition("acquisition loop exited during tare".into()))?
    }

    /// Asks the run `run_id` to stop without collecting it.
    ///
    /// Used by timers: a request for a run that already ended is ignored.
    pub fn request_stop(&self, run_id: u64) -> bool {
        let mut state = lock(&self.shared.state);
        if !matches!(*state, EngineState::Recording | EngineState::Taring) {
            return false;
        }
        let run = lock(&self.shared.run);
        match run.as_ref() {
            Some(run) if run.id == run_id => {
                run.stop.store(true, Ordering::SeqCst);
                let _ = run.commands.send(EngineCommand::Stop);
                *state = EngineState::Stopping;
                info!("Stop requested for test {run_id}");
                true
            }
            _ => false,
        }
    }

    /// Stops the test, joins every thread and returns the finalized run.
    pub fn test_stop(&self) -> Result<FinishedRun, ForceError> {
        let run = {
            let mut state = lock(&self.shared.state);
            if *state == EngineState::Idle {
                return Err(ForceError::Precondition("no test is running".into()));
            }
            *state = EngineState::Stopping;
            lock(&self.shared.run).take()
        };
        let Some(run) = run else {
            *lock(&self.shared.state) = EngineState::Idle;
            return Err(ForceError::Precondition("no test is running".into()));
        };
        run.stop.store(true, Ordering::SeqCst);
        let _ = run.commands.send(EngineCommand::Stop);
        let mut test = match run.coordinator.join() {
            Ok(test) => test,
            Err(_) => {
                error!("Acquisition coordinator of test {} panicked", run.id);
                Test::default()
            }
        };
        run.barrier.shutdown();

        let deadline = Instant::now() + self.shared.join_timeout;
        let mut pending = vec![true; run.sensors.len()];
        let mut devices = Vec::new();
        let mut faulted = Vec::new();
        while pending.iter().any(|p| *p) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match run.exits.recv_timeout(deadline - now) {
                Ok(exit) => {
                    pending[exit.slot] = false;
                    let sensor = run.sensors[exit.slot].0;
                    if exit.faulted {
                        faulted.push(sensor);
                    }
                    devices.push((sensor, exit.device));
                }
                Err(_) => break,
            }
        }
        let mut lost = Vec::new();
        for (slot, handle) in run.workers.into_iter().enumerate() {
            let (sensor, name) = &run.sensors[slot];
            if pending[slot] {
                error!(
                    "Sampling thread of {name} did not join within {:?}; fatal for sensor, its samples are dropped",
                    self.shared.join_timeout
                );
                lost.push(*sensor);
                test.sequences.retain(|s| s.sensor != *sensor);
            } else if handle.join().is_err() {
                error!("Sampling thread of {name} panicked");
            }
        }

        lock(&self.shared.timing).finished = Some(Instant::now());
        *lock(&self.shared.state) = EngineState::Idle;
        info!(
            "Test {} stopped: {} ticks, {} sensors ({} faulted, {} lost)",
            run.id,
            test.len(),
            test.sequences.len(),
            faulted.len(),
            lost.len()
        );
        Ok(FinishedRun {
            test,
            devices,
            faulted,
            lost,
        })
    }
}

/// Body of a sampling thread: one read per opened tick until shutdown or failure.
fn sample_loop(
    slot: usize,
    mut participant: Participant,
    barrier: &TickBarrier,
    exits: &Sender<WorkerExit>,
    faults: &Mutex<Vec<SensorId>>,
) {
    let mut seen = 0;
    let mut faulted = false;
    while let Some(generation) = barrier.await_tick(seen) {
        seen = generation;
        match participant.device.read_one() {
            Ok(reading) => barrier.arrive(slot, generation, reading),
            Err(e) => {
                warn!(
                    "{}: read failed ({e}), excluded for the rest of the test",
                    participant.name
                );
                barrier.withdraw(slot);
                lock(faults).push(participant.sensor);
                faulted = true;
                break;
            }
        }
    }
    debug!("Sampling thread of {} exiting", participant.name);
    let _ = exits.send(WorkerExit {
        slot,
        device: participant.device,
        faulted,
    });
}

struct Coordinator {
    interval: Duration,
    barrier: Arc<TickBarrier>,
    stop: Arc<AtomicBool>,
    commands: Receiver<EngineCommand>,
    state: Arc<Mutex<EngineState>>,
    samples: Arc<AtomicUsize>,
    test: Test,
}

enum Wake {
    Deadline,
    Stop,
    Tare {
        amount: usize,
        interval: Duration,
        reply: Sender<Result<Vec<TareWindow>, ForceError>>,
    },
}

impl Coordinator {
    fn run(mut self) -> Test {
        let mut deadline = Instant::now();
        loop {
            match self.wait_until(deadline) {
                Wake::Deadline => {}
                Wake::Stop => break,
                Wake::Tare {
                    amount,
                    interval,
                    reply,
                } => {
                    let result = self.tare(amount, interval);
                    let _ = reply.send(result);
                    if self.stopped() {
                        break;
                    }
                    deadline = Instant::now() + self.interval;
                    continue;
                }
            }
            let Some((stamp, tick)) = self.tick() else {
                break;
            };
            self.record(stamp, tick);
            deadline += self.interval;
            let now = Instant::now();
            if deadline < now {
                // a slow read stalls the grid; restart from here instead of bursting
                deadline = now;
            }
        }
        self.barrier.shutdown();
        self.test
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn wait_until(&self, deadline: Instant) -> Wake {
        loop {
            if self.stopped() {
                return Wake::Stop;
            }
            let now = Instant::now();
            let received = if now >= deadline {
                match self.commands.try_recv() {
                    Ok(command) => command,
                    Err(_) => return Wake::Deadline,
                }
            } else {
                match self.commands.recv_timeout(deadline - now) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return Wake::Stop,
                }
            };
            return match received {
                EngineCommand::Stop => Wake::Stop,
                EngineCommand::Tare {
                    amount,
                    interval,
                    reply,
                } => Wake::Tare {
                    amount,
                    interval,
                    reply,
                },
            };
        }
    }

    fn tick(&self) -> Option<(u64, Tick)> {
        self.barrier.release();
        let tick = self.barrier.collect(POLL, || self.stopped())?;
        let stamp = now_ms().max(self.test.timestamps.last().copied().unwrap_or(0));
        Some((stamp, tick))
    }

    fn record(&mut self, stamp: u64, tick: Tick) {
        let index = self.test.timestamps.len();
        self.test.timestamps.push(stamp);
        for ((sequence, value), active) in self
            .test
            .sequences
            .iter_mut()
            .zip(tick.values)
            .zip(tick.active)
        {
            if !active && sequence.faulted_at.is_none() {
                sequence.faulted_at = Some(index);
            }
            sequence.values.push(value);
        }
        self.samples.store(index + 1, Ordering::SeqCst);
    }

    fn tare(&mut self, amount: usize, interval: Duration) -> Result<Vec<TareWindow>, ForceError> {
        {
            let mut state = lock(&self.state);
            if *state != EngineState::Recording {
                return Err(ForceError::Precondition("test is stopping".into()));
            }
            *state = EngineState::Taring;
        }
        let slots: Vec<usize> = self
            .test
            .sequences
            .iter()
            .enumerate()
            .filter(|(_, s)| s.kind.is_calibrated())
            .map(|(slot, _)| slot)
            .collect();
        let mut windows: Vec<TareWindow> = slots
            .iter()
            .map(|slot| {
                let sequence = &self.test.sequences[*slot];
                TareWindow {
                    sensor: sequence.sensor,
                    name: sequence.name.clone(),
                    values: Vec::with_capacity(amount),
                }
            })
            .collect();
        let mut deadline = Instant::now();
        let mut outcome = Ok(());
        let mut collected = 0;
        while collected < amount {
            match self.wait_until(deadline) {
                Wake::Deadline => {}
                Wake::Stop => {
                    outcome = Err(ForceError::Precondition("test stopped during tare".into()));
                    break;
                }
                Wake::Tare { reply, .. } => {
                    let _ = reply.send(Err(ForceError::Precondition(
                        "a tare is already running".into(),
                    )));
                    continue;
                }
            }
            let Some((_, tick)) = self.tick() else {
                outcome = Err(ForceError::Precondition("test stopped during tare".into()));
                break;
            };
            for (window, slot) in windows.iter_mut().zip(&slots) {
                if let Some(v) = tick.values[*slot].scalar().filter(|v| v.is_finite()) {
                    window.values.push(v);
                }
            }
            collected += 1;
            deadline += interval;
            let now = Instant::now();
            if deadline < now {
                deadline = now;
            }
        }
        {
            let mut state = lock(&self.state);
            if *state == EngineState::Taring {
                *state = EngineState::Recording;
            }
        }
        outcome?;
        debug!("Tare window of {amount} ticks collected");
        Ok(windows)
    }
}
