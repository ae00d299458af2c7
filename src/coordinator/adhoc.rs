use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;

use super::{spawn_task, LoaderOptions, TaskEvent, WAIT_POLL};
use crate::audio::{AudioSource, TimeRange, TrackInfo};
use crate::cache::{DecimatedRange, RangeCache, SparseRanges};
use crate::decimate::{to_decimated, to_time, DecimationTask, TaskOutcome};

/// Receives `(range, values)` for part of a request as it becomes available.
pub type ValuesCallback = Box<dyn FnMut(DecimatedRange, &[f32])>;

/// Fires once per request.
pub type RequestCallback = Box<dyn FnOnce(RequestOutcome)>;

pub type RequestId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Every value in the request was delivered.
    Completed,
    /// The tasks serving the request ended with parts still missing.
    Incomplete,
    Cancelled,
}

struct RateState {
    cache: RangeCache,
    /// Ranges some running task has been asked to produce.
    pending: SparseRanges,
    /// True decimated length, once a task reading the tail has finished.
    final_len: Option<usize>,
}

impl RateState {
    fn clamp(&self, range: &DecimatedRange) -> DecimatedRange {
        match self.final_len {
            Some(end) => DecimatedRange::new(range.lower.min(end), range.upper.min(end)),
            None => *range,
        }
    }
}

struct Request {
    id: RequestId,
    rate: usize,
    range: DecimatedRange,
    on_values: ValuesCallback,
    on_complete: Option<RequestCallback>,
}

struct Running<S: AudioSource> {
    task: DecimationTask<S>,
    rate: usize,
    range: DecimatedRange,
    /// End of the terminal chunk, once it has arrived.
    last_upper: Option<usize>,
}

/// Serves bounded requests on demand, without loading the whole track.
///
/// Each rate keeps its own [`RangeCache`]; only the gaps that are neither
/// cached nor already being decoded spawn new tasks.
pub struct AdhocDownsampler<S: AudioSource> {
    source: Arc<S>,
    track: Arc<TrackInfo>,
    options: LoaderOptions,
    rates: BTreeMap<usize, RateState>,
    requests: Vec<Request>,
    tasks: HashMap<u64, Running<S>>,
    decibel_max: f32,
    next_request: RequestId,
    tx: Sender<TaskEvent>,
    rx: Receiver<TaskEvent>,
}

impl<S: AudioSource> AdhocDownsampler<S> {
    pub fn new(source: Arc<S>, track: Arc<TrackInfo>, options: LoaderOptions) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            source,
            track,
            decibel_max: options.floor,
            options,
            rates: BTreeMap::new(),
            requests: Vec::new(),
            tasks: HashMap::new(),
            next_request: 1,
            tx,
            rx,
        }
    }

    pub fn decibel_max(&self) -> f32 {
        self.decibel_max
    }

    pub fn running_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn outstanding_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn cache(&self, rate: usize) -> Option<&RangeCache> {
        self.rates.get(&rate).map(|s| &s.cache)
    }

    /// Ask for `range` at `rate`. Cached parts are delivered immediately;
    /// missing parts arrive through [`process_events`](Self::process_events).
    ///
    /// Empty ranges and a zero rate are ignored and return `None`.
    pub fn request(
        &mut self,
        rate: usize,
        range: TimeRange,
        mut on_values: ValuesCallback,
        on_complete: RequestCallback,
    ) -> Option<RequestId> {
        if rate == 0 || range.is_empty() {
            return None;
        }
        let wanted = to_decimated(&self.track, &range, rate);
        if wanted.is_empty() {
            return None;
        }

        let id = self.next_request;
        self.next_request += 1;

        let floor = self.options.floor;
        let len = self.track.decimated_len(rate);
        let state = self.rates.entry(rate).or_insert_with(|| RateState {
            cache: RangeCache::with_capacity(floor, len),
            pending: SparseRanges::new(),
            final_len: None,
        });

        if let Some(hits) = state.cache.intersect(&wanted) {
            for hit in &hits {
                if let Some(values) = state.cache.values(hit) {
                    on_values(*hit, values);
                }
            }
        }

        let Some(gaps) = state.cache.diff(&state.clamp(&wanted)) else {
            log::debug!("Request {} for {} at rate {} served from cache", id, wanted, rate);
            on_complete(RequestOutcome::Completed);
            return Some(id);
        };

        let mut to_spawn = Vec::new();
        for gap in &gaps {
            if let Some(unclaimed) = state.pending.diff(gap) {
                for part in &unclaimed {
                    state.pending.add(*part);
                    to_spawn.push(*part);
                }
            }
        }

        for part in to_spawn {
            let time = to_time(&self.track, &part, rate);
            let task = spawn_task(
                &self.source,
                &self.track,
                time,
                rate,
                &self.options,
                self.decibel_max,
                &self.tx,
            );
            log::debug!("Request {}: task {} decoding {} at rate {}", id, task.id(), part, rate);
            self.tasks.insert(
                task.id(),
                Running {
                    task,
                    rate,
                    range: part,
                    last_upper: None,
                },
            );
        }

        self.requests.push(Request {
            id,
            rate,
            range: wanted,
            on_values,
            on_complete: Some(on_complete),
        });
        Some(id)
    }

    /// Drop a request without cancelling the work already running for it.
    pub fn forget(&mut self, id: RequestId) -> bool {
        let before = self.requests.len();
        self.requests.retain(|r| r.id != id);
        self.requests.len() != before
    }

    /// Apply every queued task message. Returns how many were applied.
    pub fn process_events(&mut self) -> usize {
        let mut applied = 0;
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    self.apply(event);
                    applied += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    log::error!("Ad-hoc task channel disconnected unexpectedly");
                    break;
                }
            }
        }
        applied
    }

    /// Block until every running task has finished and been applied.
    pub fn wait(&mut self) {
        while !self.tasks.is_empty() {
            match self.rx.recv_timeout(WAIT_POLL) {
                Ok(event) => self.apply(event),
                Err(RecvTimeoutError::Timeout) => {
                    self.process_events();
                    self.reap_dead_workers();
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// Stop every running task and drop all outstanding requests.
    pub fn cancel_all(&mut self) {
        for running in self.tasks.values() {
            running.task.cancel();
        }
        self.tasks.clear();
        for state in self.rates.values_mut() {
            state.pending.clear();
        }
        for mut request in self.requests.drain(..) {
            if let Some(done) = request.on_complete.take() {
                done(RequestOutcome::Cancelled);
            }
        }
    }

    /// Clear every cache, as on reload.
    pub fn reset(&mut self) {
        self.cancel_all();
        self.rates.clear();
    }

    fn apply(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::Chunk {
                task_id,
                rate,
                range,
                values,
                last,
                decibel_max,
            } => {
                if decibel_max > self.decibel_max {
                    self.decibel_max = decibel_max;
                }
                if last {
                    if let Some(running) = self.tasks.get_mut(&task_id) {
                        running.last_upper = Some(range.upper);
                    }
                }
                // Results of cancelled tasks are still valid; keep them.
                let Some(state) = self.rates.get_mut(&rate) else {
                    return;
                };
                if !range.is_empty() {
                    state.cache.insert(range, &values);
                    state.pending.remove(range);
                }
                self.deliver(rate, range);
            }
            TaskEvent::Finished { task_id, outcome } => {
                let Some(running) = self.tasks.remove(&task_id) else {
                    return;
                };
                if let TaskOutcome::Failed(reason) = &outcome {
                    log::warn!("Ad-hoc task {} at rate {} failed: {}", task_id, running.rate, reason);
                }
                // Only a clean read through the tail tells the true length.
                let reaches_end = running.task.handle().time_range().end >= self.track.duration;
                let true_len = match (&outcome, running.last_upper) {
                    (TaskOutcome::Completed, Some(upper)) if reaches_end => Some(upper),
                    _ => None,
                };
                if let Some(state) = self.rates.get_mut(&running.rate) {
                    state.pending.remove(running.range);
                    if let Some(len) = true_len {
                        state.cache.truncate(len);
                        state.final_len = Some(len);
                    }
                }
                self.settle(running.rate);
            }
        }
    }

    /// Hand the fresh slice to every overlapping request, then complete the
    /// ones with nothing left to wait for.
    fn deliver(&mut self, rate: usize, range: DecimatedRange) {
        let Some(state) = self.rates.get(&rate) else {
            return;
        };
        for request in self.requests.iter_mut().filter(|r| r.rate == rate) {
            if let Some(part) = request.range.intersection(&range) {
                if let Some(values) = state.cache.values(&part) {
                    (request.on_values)(part, values);
                }
            }
        }
        self.settle(rate);
    }

    fn settle(&mut self, rate: usize) {
        let Some(state) = self.rates.get(&rate) else {
            return;
        };
        let mut finished = Vec::new();
        for (idx, request) in self.requests.iter().enumerate().filter(|(_, r)| r.rate == rate) {
            let wanted = state.clamp(&request.range);
            let outcome = if state.cache.diff(&wanted).is_none() {
                Some(RequestOutcome::Completed)
            } else if state.pending.intersect(&wanted).is_some() {
                None
            } else {
                Some(RequestOutcome::Incomplete)
            };
            if let Some(outcome) = outcome {
                finished.push((idx, outcome));
            }
        }
        for (idx, outcome) in finished.into_iter().rev() {
            let mut request = self.requests.remove(idx);
            log::debug!("Request {} {:?}", request.id, outcome);
            if let Some(done) = request.on_complete.take() {
                done(outcome);
            }
        }
    }

    fn reap_dead_workers(&mut self) {
        let dead: Vec<u64> = self
            .tasks
            .iter()
            .filter(|(_, r)| r.task.has_exited())
            .map(|(id, _)| *id)
            .collect();
        for task_id in dead {
            log::error!("Ad-hoc task {} exited without reporting", task_id);
            self.apply(TaskEvent::Finished {
                task_id,
                outcome: TaskOutcome::Failed("worker exited".into()),
            });
        }
    }
}

impl<S: AudioSource> Drop for AdhocDownsampler<S> {
    fn drop(&mut self) {
        for running in self.tasks.values() {
            running.task.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::memory::{sine_samples, MemorySource};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn options() -> LoaderOptions {
        LoaderOptions {
            floor: -50.0,
            chunk_units: 16,
        }
    }

    fn downsampler(source: MemorySource) -> AdhocDownsampler<MemorySource> {
        let track = source.open("tone").unwrap();
        AdhocDownsampler::new(Arc::new(source), Arc::new(track), options())
    }

    fn tone() -> MemorySource {
        MemorySource::new("tone", sine_samples(80000, 1, 8000, 0.6), 8000, 1).with_chunk_frames(vec![900])
    }

    struct Recorder {
        values: Rc<RefCell<Vec<(DecimatedRange, Vec<f32>)>>>,
        outcome: Rc<RefCell<Option<RequestOutcome>>>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                values: Rc::new(RefCell::new(Vec::new())),
                outcome: Rc::new(RefCell::new(None)),
            }
        }

        fn callbacks(&self) -> (ValuesCallback, RequestCallback) {
            let values = Rc::clone(&self.values);
            let outcome = Rc::clone(&self.outcome);
            let on_values: ValuesCallback = Box::new(move |range, v| values.borrow_mut().push((range, v.to_vec())));
            let on_complete: RequestCallback = Box::new(move |o| *outcome.borrow_mut() = Some(o));
            (on_values, on_complete)
        }

        fn delivered(&self) -> usize {
            self.values.borrow().iter().map(|(_, v)| v.len()).sum()
        }

        fn outcome(&self) -> Option<RequestOutcome> {
            *self.outcome.borrow()
        }
    }

    #[test]
    fn second_request_is_served_from_cache() {
        let mut adhoc = downsampler(tone());
        let recorder = Recorder::new();
        let (on_values, on_complete) = recorder.callbacks();
        adhoc.request(100, TimeRange::new(1.0, 3.0), on_values, on_complete).unwrap();
        assert_eq!(adhoc.running_tasks(), 1);
        adhoc.wait();
        assert_eq!(recorder.outcome(), Some(RequestOutcome::Completed));
        assert_eq!(recorder.delivered(), 200);

        let again = Recorder::new();
        let (on_values, on_complete) = again.callbacks();
        adhoc.request(100, TimeRange::new(2.0, 3.0), on_values, on_complete).unwrap();
        // answered before returning
        assert_eq!(again.outcome(), Some(RequestOutcome::Completed));
        assert_eq!(again.delivered(), 100);
        assert_eq!(adhoc.running_tasks(), 0);
        assert_eq!(adhoc.cache(100).unwrap().values(&DecimatedRange::new(200, 300)).unwrap(), &again.values.borrow()[0].1[..]);
    }

    #[test]
    fn overlapping_requests_share_pending_work() {
        let mut adhoc = downsampler(tone());
        let first = Recorder::new();
        let second = Recorder::new();
        let (v, c) = first.callbacks();
        adhoc.request(100, TimeRange::new(0.0, 4.0), v, c).unwrap();
        let (v, c) = second.callbacks();
        adhoc.request(100, TimeRange::new(2.0, 6.0), v, c).unwrap();
        // only 4..6 s needed a new task
        assert_eq!(adhoc.running_tasks(), 2);
        assert_eq!(adhoc.outstanding_requests(), 2);

        adhoc.wait();
        assert_eq!(first.outcome(), Some(RequestOutcome::Completed));
        assert_eq!(second.outcome(), Some(RequestOutcome::Completed));
        assert_eq!(first.delivered(), 400);
        assert_eq!(second.delivered(), 400);
        assert_eq!(adhoc.outstanding_requests(), 0);
        assert_eq!(adhoc.cache(100).unwrap().handled().covered(), 600);
    }

    #[test]
    fn empty_requests_are_refused() {
        let mut adhoc = downsampler(tone());
        let recorder = Recorder::new();
        let (v, c) = recorder.callbacks();
        assert!(adhoc.request(100, TimeRange::new(2.0, 2.0), v, c).is_none());
        let (v, c) = recorder.callbacks();
        assert!(adhoc.request(0, TimeRange::new(0.0, 1.0), v, c).is_none());
        assert_eq!(recorder.outcome(), None);
        assert_eq!(adhoc.running_tasks(), 0);
    }

    #[test]
    fn cancel_all_reports_cancelled() {
        let mut adhoc = downsampler(tone());
        let recorder = Recorder::new();
        let (v, c) = recorder.callbacks();
        adhoc.request(10, TimeRange::new(0.0, 10.0), v, c).unwrap();
        adhoc.cancel_all();
        assert_eq!(recorder.outcome(), Some(RequestOutcome::Cancelled));
        assert_eq!(adhoc.running_tasks(), 0);
        assert_eq!(adhoc.outstanding_requests(), 0);
        // late messages from the cancelled task are harmless
        adhoc.wait();
        adhoc.process_events();
    }

    #[test]
    fn forget_drops_request_but_keeps_work() {
        let mut adhoc = downsampler(tone());
        let recorder = Recorder::new();
        let (v, c) = recorder.callbacks();
        let id = adhoc.request(100, TimeRange::new(0.0, 1.0), v, c).unwrap();
        assert!(adhoc.forget(id));
        assert!(!adhoc.forget(id));
        adhoc.wait();
        assert_eq!(recorder.outcome(), None);
        assert_eq!(adhoc.cache(100).unwrap().handled().covered(), 100);
    }

    #[test]
    fn overestimated_length_is_truncated_at_tail() {
        let source = tone();
        let mut track = source.open("tone").unwrap();
        track.total_samples = 88000;
        track.duration = 11.0;
        let mut adhoc = AdhocDownsampler::new(Arc::new(source), Arc::new(track), options());

        let recorder = Recorder::new();
        let (v, c) = recorder.callbacks();
        adhoc.request(1000, TimeRange::new(9.0, 11.0), v, c).unwrap();
        adhoc.wait();
        assert_eq!(recorder.outcome(), Some(RequestOutcome::Completed));
        assert_eq!(recorder.delivered(), 8);
        assert_eq!(adhoc.cache(1000).unwrap().len(), 80);
    }

    #[test]
    fn tail_decode_failure_does_not_shorten_track() {
        let mut adhoc = downsampler(tone().with_failure_after(1));
        let recorder = Recorder::new();
        let (v, c) = recorder.callbacks();
        adhoc.request(100, TimeRange::new(8.0, 10.0), v, c).unwrap();
        adhoc.wait();
        assert_eq!(recorder.outcome(), Some(RequestOutcome::Incomplete));
        // one 900-frame chunk made it through
        assert_eq!(recorder.delivered(), 9);
        assert_eq!(adhoc.cache(100).unwrap().len(), 1000);

        // past the failure point nothing is considered final
        let later = Recorder::new();
        let (v, c) = later.callbacks();
        adhoc.request(100, TimeRange::new(9.5, 10.0), v, c).unwrap();
        assert_eq!(later.outcome(), None);
        assert_eq!(adhoc.running_tasks(), 1);
        adhoc.wait();
        assert_eq!(later.outcome(), Some(RequestOutcome::Incomplete));
    }

    #[test]
    fn failing_source_leaves_request_incomplete() {
        let mut adhoc = downsampler(tone().with_failure_after(0));
        let recorder = Recorder::new();
        let (v, c) = recorder.callbacks();
        adhoc.request(100, TimeRange::new(0.0, 2.0), v, c).unwrap();
        adhoc.wait();
        assert_eq!(recorder.outcome(), Some(RequestOutcome::Incomplete));
        assert_eq!(recorder.delivered(), 0);
    }
}
