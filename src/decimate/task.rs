use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::decimator::SampleDecimator;
use super::reader::{ChunkedPcmReader, ReadEnd};
use crate::audio::{pcm_from_bytes, AudioSource, TimeRange, TrackInfo, BYTES_PER_SAMPLE};
use crate::cache::DecimatedRange;

/// Decimated values delivered per callback unless configured otherwise.
pub const DEFAULT_CHUNK_UNITS: usize = 64;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Executing,
    Finished,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskState::Idle,
            1 => TaskState::Executing,
            _ => TaskState::Finished,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TaskOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

/// Per-chunk callback: `(task, range, values, last_call) -> keep_going`.
pub type ChunkCallback = Box<dyn FnMut(&TaskHandle, DecimatedRange, Vec<f32>, bool) -> bool + Send>;

/// Fires exactly once when a started task ends, whatever the reason.
pub type CompletionCallback = Box<dyn FnOnce(&TaskHandle, TaskOutcome) + Send>;

struct TaskShared {
    id: u64,
    rate: usize,
    time_range: TimeRange,
    state: AtomicU8,
    cancelled: AtomicBool,
    decibel_max: AtomicU32,
}

/// Shared view of a task: state, cancellation and the running ceiling.
///
/// Cheap to clone and safe to read from any thread.
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<TaskShared>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn rate(&self) -> usize {
        self.shared.rate
    }

    pub fn time_range(&self) -> TimeRange {
        self.shared.time_range
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_finished(&self) -> bool {
        self.state() == TaskState::Finished
    }

    /// Request a stop at the next unit boundary.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    pub fn decibel_max(&self) -> f32 {
        f32::from_bits(self.shared.decibel_max.load(Ordering::Acquire))
    }

    fn raise_decibel_max(&self, value: f32) {
        let _ = self
            .shared
            .decibel_max
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                (value > f32::from_bits(bits)).then_some(value.to_bits())
            });
    }

    fn set_state(&self, state: TaskState) {
        self.shared.state.store(state as u8, Ordering::Release);
    }

    fn try_begin(&self) -> bool {
        self.shared
            .state
            .compare_exchange(
                TaskState::Idle as u8,
                TaskState::Executing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("rate", &self.rate())
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Everything a run needs, moved onto the worker thread.
struct Job<S: AudioSource> {
    handle: TaskHandle,
    source: Arc<S>,
    track: Arc<TrackInfo>,
    floor: f32,
    chunk_units: usize,
    on_chunk: ChunkCallback,
    on_complete: Option<CompletionCallback>,
}

/// Decimates one time range of a track at one rate, streaming the values
/// back through a callback.
pub struct DecimationTask<S: AudioSource> {
    handle: TaskHandle,
    job: Option<Job<S>>,
    thread: Option<JoinHandle<()>>,
}

impl<S: AudioSource> DecimationTask<S> {
    pub fn new(
        source: Arc<S>,
        track: Arc<TrackInfo>,
        time_range: TimeRange,
        rate: usize,
        floor: f32,
        decibel_max: f32,
        on_chunk: ChunkCallback,
    ) -> Self {
        let handle = TaskHandle {
            shared: Arc::new(TaskShared {
                id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
                rate,
                time_range,
                state: AtomicU8::new(TaskState::Idle as u8),
                cancelled: AtomicBool::new(false),
                decibel_max: AtomicU32::new(decibel_max.to_bits()),
            }),
        };
        Self {
            job: Some(Job {
                handle: handle.clone(),
                source,
                track,
                floor,
                chunk_units: DEFAULT_CHUNK_UNITS,
                on_chunk,
                on_complete: None,
            }),
            handle,
            thread: None,
        }
    }

    /// Number of decimated values per callback.
    pub fn with_chunk_units(mut self, units: usize) -> Self {
        if let Some(job) = self.job.as_mut() {
            job.chunk_units = units.max(1);
        }
        self
    }

    pub fn on_complete(mut self, callback: CompletionCallback) -> Self {
        if let Some(job) = self.job.as_mut() {
            job.on_complete = Some(callback);
        }
        self
    }

    pub fn handle(&self) -> TaskHandle {
        self.handle.clone()
    }

    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    pub fn state(&self) -> TaskState {
        self.handle.state()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Run on a background thread. Calling again once started does nothing.
    pub fn start(&mut self) {
        if !self.handle.try_begin() {
            return;
        }
        let Some(job) = self.job.take() else {
            return;
        };
        let name = format!("decimate-{}", self.handle.id());

        // The job is shared with the closure so it can be recovered if the
        // thread cannot be spawned.
        let slot = Arc::new(std::sync::Mutex::new(Some(job)));
        let for_thread = Arc::clone(&slot);
        let spawned = thread::Builder::new().name(name).spawn(move || {
            let job = for_thread.lock().ok().and_then(|mut j| j.take());
            if let Some(job) = job {
                execute(job);
            }
        });

        match spawned {
            Ok(thread) => self.thread = Some(thread),
            Err(e) => {
                log::error!("Failed to spawn decimation thread: {}", e);
                let job = slot.lock().ok().and_then(|mut j| j.take());
                if let Some(mut job) = job {
                    job.handle.set_state(TaskState::Finished);
                    if let Some(done) = job.on_complete.take() {
                        done(&job.handle, TaskOutcome::Failed(e.to_string()));
                    }
                }
            }
        }
    }

    /// Run on the calling thread. Returns `None` if the task was already
    /// started.
    pub fn run(&mut self) -> Option<TaskOutcome> {
        if !self.handle.try_begin() {
            return None;
        }
        let job = self.job.take()?;
        Some(execute(job))
    }

    /// True once no worker is left for this task: its thread has returned,
    /// or it was never started on one and has finished.
    pub fn has_exited(&self) -> bool {
        match &self.thread {
            Some(thread) => thread.is_finished(),
            None => self.job.is_none() && self.state() == TaskState::Finished,
        }
    }

    /// Wait for a background run to finish.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Decimation task {} panicked", self.handle.id());
            }
        }
    }
}

/// Index of the first decimated value for a range starting at `range.start`.
pub fn first_index(track: &TrackInfo, range: &TimeRange, rate: usize) -> usize {
    if rate == 0 {
        return 0;
    }
    range.start_frame(track.sample_rate) as usize / rate
}

fn execute<S: AudioSource>(mut job: Job<S>) -> TaskOutcome {
    let handle = job.handle.clone();
    let rate = handle.rate();
    let range = handle.time_range().clamp_to(job.track.duration);

    let outcome = if rate == 0 || range.is_empty() {
        log::debug!("Task {}: empty request, nothing to do", handle.id());
        TaskOutcome::Completed
    } else if handle.is_cancelled() {
        TaskOutcome::Cancelled
    } else {
        decimate_range(&mut job, range)
    };

    handle.set_state(TaskState::Finished);
    if let Some(done) = job.on_complete.take() {
        done(&handle, outcome.clone());
    }
    outcome
}

fn decimate_range<S: AudioSource>(job: &mut Job<S>, range: TimeRange) -> TaskOutcome {
    let handle = job.handle.clone();
    let rate = handle.rate();
    let unit_size = job.track.channels as usize * rate;
    let reader = ChunkedPcmReader::new(unit_size * job.chunk_units * BYTES_PER_SAMPLE);
    let mut decimator = SampleDecimator::new(unit_size, job.floor, handle.decibel_max());
    let mut cursor = first_index(&job.track, &range, rate);
    let on_chunk = &mut job.on_chunk;

    log::debug!(
        "Task {}: decimating {:.3}s..{:.3}s of {} at rate {}",
        handle.id(),
        range.start,
        range.end,
        job.track.id,
        rate
    );

    let summary = reader.iterate_sample_data(job.source.as_ref(), &job.track, range, |bytes, last| {
        let samples = pcm_from_bytes(bytes);
        let values = decimator.process(&samples);
        handle.raise_decibel_max(decimator.decibel_max());

        let chunk_range = DecimatedRange::new(cursor, cursor + values.len());
        cursor = chunk_range.upper;

        if last {
            handle.set_state(TaskState::Finished);
            on_chunk(&handle, chunk_range, values, true);
            return false;
        }
        if !on_chunk(&handle, chunk_range, values, false) {
            handle.cancel();
        }
        !handle.is_cancelled()
    });

    match summary.end {
        ReadEnd::Completed | ReadEnd::BudgetExhausted => TaskOutcome::Completed,
        ReadEnd::Stopped => {
            log::debug!("Task {} stopped after {} chunks", handle.id(), summary.calls);
            TaskOutcome::Cancelled
        }
        ReadEnd::Failed(reason) => TaskOutcome::Failed(reason),
        ReadEnd::NotOpened => TaskOutcome::Failed(format!("could not read {}", job.track.id)),
    }
}
