use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;

use super::adhoc::{AdhocDownsampler, RequestCallback, RequestId, ValuesCallback};
use super::resolution::{ResolutionHandler, ResolutionToken, Subscriber};
use super::{spawn_task, LoaderOptions, TaskEvent, WAIT_POLL};
use crate::audio::{AudioSource, TimeRange, TrackInfo};
use crate::cache::{cache_key, CacheStore, DecimatedRange};
use crate::decimate::{to_decimated, DecimationTask, TaskOutcome};
use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadStatus {
    Idle,
    Loading,
    Loaded,
    Failed,
}

/// Called once each time a full-track load ends, with the final status.
pub type LoadCallback = Box<dyn FnMut(LoadStatus)>;

struct PrimaryRun<S: AudioSource> {
    task: DecimationTask<S>,
    rate: usize,
    received_last: bool,
}

/// Loads a whole track once at the finest registered rate and derives every
/// coarser registered rate from that stream.
pub struct MultiResolutionCoordinator<S: AudioSource> {
    source: Arc<S>,
    track: Arc<TrackInfo>,
    options: LoaderOptions,
    status: LoadStatus,
    handlers: BTreeMap<usize, ResolutionHandler>,
    primary: Option<PrimaryRun<S>>,
    /// Rate whose handler holds the audio-derived data of the last load.
    loaded_rate: Option<usize>,
    decibel_max: f32,
    next_token: u64,
    store: Option<Box<dyn CacheStore>>,
    on_loaded: Vec<LoadCallback>,
    adhoc: AdhocDownsampler<S>,
    tx: Sender<TaskEvent>,
    rx: Receiver<TaskEvent>,
}

impl<S: AudioSource> MultiResolutionCoordinator<S> {
    /// Open `id` through `source`. Failing to open is the only error surfaced
    /// here; everything later is reported through the load status.
    pub fn open(source: Arc<S>, id: &str, options: LoaderOptions) -> Result<Self> {
        let track = source.open(id)?;
        Ok(Self::new(source, track, options))
    }

    pub fn new(source: Arc<S>, track: TrackInfo, options: LoaderOptions) -> Self {
        let track = Arc::new(track);
        let (tx, rx) = mpsc::channel();
        Self {
            adhoc: AdhocDownsampler::new(Arc::clone(&source), Arc::clone(&track), options),
            source,
            track,
            options,
            status: LoadStatus::Idle,
            handlers: BTreeMap::new(),
            primary: None,
            loaded_rate: None,
            decibel_max: options.floor,
            next_token: 1,
            store: None,
            on_loaded: Vec::new(),
            tx,
            rx,
        }
    }

    /// Consult and fill `store` around full-track loads.
    pub fn with_store(mut self, store: Box<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn track(&self) -> &TrackInfo {
        &self.track
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    pub fn status(&self) -> LoadStatus {
        self.status
    }

    /// Highest level seen by any task so far. Never decreases.
    pub fn decibel_max(&self) -> f32 {
        self.decibel_max.max(self.adhoc.decibel_max())
    }

    /// The finest registered rate.
    pub fn primary_rate(&self) -> Option<usize> {
        self.handlers.keys().next().copied()
    }

    pub fn rates(&self) -> impl Iterator<Item = usize> + '_ {
        self.handlers.keys().copied()
    }

    pub fn handler(&self, rate: usize) -> Option<&ResolutionHandler> {
        self.handlers.get(&rate)
    }

    /// Fraction of the primary resolution filled in.
    pub fn progress(&self) -> f32 {
        match self.status {
            LoadStatus::Loaded => 1.0,
            LoadStatus::Idle | LoadStatus::Failed => 0.0,
            LoadStatus::Loading => self
                .primary
                .as_ref()
                .and_then(|run| self.handlers.get(&run.rate))
                .filter(|h| !h.is_empty())
                .map(|h| h.next_pos() as f32 / h.len() as f32)
                .unwrap_or(0.0),
        }
    }

    /// Register interest in `rate`. `subscriber` receives everything the
    /// resolution already has, then every later update. Returns `None` for a
    /// zero rate.
    pub fn add_resolution(&mut self, rate: usize, subscriber: Subscriber) -> Option<ResolutionToken> {
        if rate == 0 {
            return None;
        }
        let id = self.next_token;
        self.next_token += 1;

        let was_primary = self.primary_rate();
        let len = self.track.decimated_len(rate);
        let floor = self.options.floor;
        let handler = self.handlers.entry(rate).or_insert_with(|| {
            log::debug!("New resolution at rate {} ({} values)", rate, len);
            ResolutionHandler::new(rate, len, floor)
        });
        handler.subscribe(id, subscriber);

        let finer = was_primary.map_or(false, |p| rate < p);
        match self.status {
            LoadStatus::Loading | LoadStatus::Loaded if finer => {
                log::info!("Rate {} is finer than the current primary, reloading", rate);
                self.reload();
            }
            LoadStatus::Loading | LoadStatus::Loaded => self.catch_up(rate),
            LoadStatus::Idle | LoadStatus::Failed => {}
        }

        Some(ResolutionToken { rate, id })
    }

    /// Unregister. The resolution goes away with its last subscriber.
    pub fn remove_resolution(&mut self, token: ResolutionToken) -> bool {
        let Some(handler) = self.handlers.get_mut(&token.rate) else {
            return false;
        };
        if !handler.unsubscribe(token.id) {
            return false;
        }
        if handler.subscriber_count() > 0 {
            return true;
        }
        self.handlers.remove(&token.rate);
        log::debug!("Dropped resolution at rate {}", token.rate);

        if self.handlers.is_empty() {
            self.cancel_primary();
            self.loaded_rate = None;
            self.status = LoadStatus::Idle;
            return true;
        }
        let running_rate = self.primary.as_ref().map(|run| run.rate);
        if self.status == LoadStatus::Loading && running_rate == Some(token.rate) {
            log::info!("Primary rate {} removed mid-load, reloading", token.rate);
            self.reload();
        }
        true
    }

    /// Start the full-track load at the finest registered rate. Does nothing
    /// unless idle or failed.
    pub fn start_loading(&mut self) {
        if !matches!(self.status, LoadStatus::Idle | LoadStatus::Failed) {
            return;
        }
        let Some(rate) = self.primary_rate() else {
            log::warn!("start_loading called with no registered resolutions");
            return;
        };

        for (&r, handler) in self.handlers.iter_mut() {
            handler.reset(self.track.decimated_len(r));
        }
        self.loaded_rate = None;

        if self.load_from_store(rate) {
            return;
        }

        let task = spawn_task(
            &self.source,
            &self.track,
            self.track.full_range(),
            rate,
            &self.options,
            self.decibel_max,
            &self.tx,
        );
        log::info!(
            "Loading {} at rate {} (task {}, {} resolutions)",
            self.track.id,
            rate,
            task.id(),
            self.handlers.len()
        );
        self.primary = Some(PrimaryRun {
            task,
            rate,
            received_last: false,
        });
        self.status = LoadStatus::Loading;
    }

    /// Register a callback for the end of every full-track load.
    pub fn on_loaded(&mut self, callback: LoadCallback) {
        self.on_loaded.push(callback);
    }

    /// Values of `rate` covering `range`, once all of them are final.
    pub fn query(&self, rate: usize, range: TimeRange) -> Option<&[f32]> {
        let handler = self.handlers.get(&rate)?;
        let wanted = to_decimated(&self.track, &range, rate);
        let upper = wanted.upper.min(handler.len());
        let lower = wanted.lower.min(upper);
        if upper > handler.next_pos() {
            return None;
        }
        Some(&handler.values()[lower..upper])
    }

    /// Every value of `rate` computed so far.
    pub fn values(&self, rate: usize) -> Option<&[f32]> {
        self.handlers.get(&rate).map(|h| &h.values()[..h.next_pos()])
    }

    /// Serve `range` at `rate` on demand, outside the full-track load.
    pub fn request(
        &mut self,
        rate: usize,
        range: TimeRange,
        on_values: ValuesCallback,
        on_complete: RequestCallback,
    ) -> Option<RequestId> {
        self.adhoc.request(rate, range, on_values, on_complete)
    }

    pub fn adhoc(&self) -> &AdhocDownsampler<S> {
        &self.adhoc
    }

    pub fn adhoc_mut(&mut self) -> &mut AdhocDownsampler<S> {
        &mut self.adhoc
    }

    /// Stop the full-track load and every ad-hoc task.
    pub fn cancel_all(&mut self) {
        self.cancel_primary();
        if self.status == LoadStatus::Loading {
            self.status = LoadStatus::Idle;
        }
        self.adhoc.cancel_all();
    }

    /// Apply every queued task message. Returns how many were applied.
    pub fn process_events(&mut self) -> usize {
        let mut applied = self.adhoc.process_events();
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    self.apply(event);
                    applied += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    log::error!("Coordinator task channel disconnected unexpectedly");
                    break;
                }
            }
        }
        applied
    }

    /// Block until the full-track load and all ad-hoc tasks are done.
    pub fn wait(&mut self) {
        while self.status == LoadStatus::Loading {
            self.wait_step();
        }
        self.adhoc.wait();
    }

    /// Block for at most one poll interval, applying what arrives.
    pub fn wait_step(&mut self) {
        match self.rx.recv_timeout(WAIT_POLL) {
            Ok(event) => {
                self.apply(event);
                self.process_events();
            }
            Err(RecvTimeoutError::Timeout) => {
                self.process_events();
                self.reap_dead_primary();
            }
            Err(RecvTimeoutError::Disconnected) => {}
        }
    }

    fn apply(&mut self, event: TaskEvent) {
        let current = self.primary.as_ref().map(|run| run.task.id());
        match event {
            TaskEvent::Chunk {
                task_id,
                range,
                values,
                last,
                decibel_max,
                ..
            } => {
                if current != Some(task_id) {
                    return;
                }
                if decibel_max > self.decibel_max {
                    self.decibel_max = decibel_max;
                }
                let Some(run) = self.primary.as_mut() else {
                    return;
                };
                run.received_last |= last;
                let rate = run.rate;
                self.apply_primary_chunk(rate, range, &values, last);
            }
            TaskEvent::Finished { task_id, outcome } => {
                if current != Some(task_id) {
                    return;
                }
                self.finish_primary(outcome);
            }
        }
    }

    fn apply_primary_chunk(&mut self, rate: usize, range: DecimatedRange, values: &[f32], last: bool) {
        let Some(mut primary) = self.handlers.remove(&rate) else {
            return;
        };
        if !values.is_empty() {
            let stored = primary.store(range, values);
            primary.notify(stored);
        }
        if last {
            primary.finish();
        }

        let available = primary.next_pos();
        for handler in self.handlers.values_mut() {
            if let Some(derived) = handler.derive_from(primary.values(), rate, available, last) {
                handler.notify(derived);
            }
            if last {
                handler.finish();
            }
        }
        self.handlers.insert(rate, primary);
    }

    fn finish_primary(&mut self, outcome: TaskOutcome) {
        let Some(run) = self.primary.take() else {
            return;
        };
        match outcome {
            TaskOutcome::Completed => {
                self.loaded_rate = Some(run.rate);
                self.status = LoadStatus::Loaded;
                log::info!("Loaded {} at rate {} (max {:.1} dB)", self.track.id, run.rate, self.decibel_max);
                self.save_to_store(run.rate);
            }
            TaskOutcome::Failed(reason) if run.received_last => {
                log::warn!("Decode anomaly while loading {}: {}; keeping partial waveform", self.track.id, reason);
                self.loaded_rate = Some(run.rate);
                self.status = LoadStatus::Loaded;
            }
            TaskOutcome::Failed(reason) => {
                log::error!("Failed to load {}: {}", self.track.id, reason);
                self.status = LoadStatus::Failed;
            }
            TaskOutcome::Cancelled => {
                self.status = LoadStatus::Idle;
                return;
            }
        }
        let status = self.status;
        for callback in self.on_loaded.iter_mut() {
            callback(status);
        }
    }

    /// Cancel the running load and start over at the current finest rate.
    fn reload(&mut self) {
        self.cancel_primary();
        self.status = LoadStatus::Idle;
        self.start_loading();
    }

    fn cancel_primary(&mut self) {
        if let Some(run) = self.primary.take() {
            log::debug!("Cancelling primary task {}", run.task.id());
            run.task.cancel();
        }
    }

    /// Derive a newly registered coarser rate from what the primary has.
    fn catch_up(&mut self, rate: usize) {
        let primary_rate = match (self.status, self.primary.as_ref()) {
            (LoadStatus::Loading, Some(run)) => run.rate,
            (LoadStatus::Loaded, _) => match self.loaded_rate {
                Some(r) => r,
                None => return,
            },
            _ => return,
        };
        if primary_rate == rate {
            return;
        }
        let loaded = self.status == LoadStatus::Loaded;

        let Some(primary) = self.handlers.remove(&primary_rate) else {
            // The primary's data is gone; only a fresh load can fill this rate.
            if loaded {
                log::info!("No primary data for rate {}, reloading", rate);
                self.status = LoadStatus::Idle;
                self.start_loading();
            }
            return;
        };
        if let Some(handler) = self.handlers.get_mut(&rate) {
            if handler.next_pos() == 0 {
                if let Some(derived) = handler.derive_from(primary.values(), primary_rate, primary.next_pos(), loaded) {
                    handler.notify(derived);
                }
                if loaded {
                    handler.finish();
                }
            }
        }
        self.handlers.insert(primary_rate, primary);
    }

    fn load_from_store(&mut self, rate: usize) -> bool {
        let Some(store) = self.store.as_ref() else {
            return false;
        };
        let key = cache_key(&self.track, rate, self.options.floor);
        let Some(values) = store.load(&key) else {
            return false;
        };
        // Saved arrays are trimmed to the decoded length, which can fall short
        // of what the container declares.
        let expected = self.track.decimated_len(rate);
        if values.is_empty() || values.len() > expected {
            log::warn!("Cached waveform {} has {} values, expected at most {}", key, values.len(), expected);
            return false;
        }
        log::info!("Loaded {} at rate {} from cache", self.track.id, rate);

        let max = values.iter().copied().fold(self.options.floor, f32::max);
        if max > self.decibel_max {
            self.decibel_max = max;
        }

        // Replay the cached array as one terminal chunk.
        self.apply_primary_chunk(rate, DecimatedRange::new(0, values.len()), &values, true);
        self.loaded_rate = Some(rate);
        self.status = LoadStatus::Loaded;
        for callback in self.on_loaded.iter_mut() {
            callback(LoadStatus::Loaded);
        }
        true
    }

    fn save_to_store(&self, rate: usize) {
        let (Some(store), Some(handler)) = (self.store.as_ref(), self.handlers.get(&rate)) else {
            return;
        };
        let key = cache_key(&self.track, rate, self.options.floor);
        if !store.save(&key, handler.values()) {
            log::warn!("Could not cache waveform for {}", self.track.id);
        }
    }

    fn reap_dead_primary(&mut self) {
        let dead = self
            .primary
            .as_ref()
            .map(|run| run.task.has_exited())
            .unwrap_or(false);
        if dead {
            log::error!("Primary task exited without reporting");
            self.finish_primary(TaskOutcome::Failed("worker exited".into()));
        }
    }
}

impl<S: AudioSource> Drop for MultiResolutionCoordinator<S> {
    fn drop(&mut self) {
        self.cancel_primary();
    }
}
