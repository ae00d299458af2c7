//! Owning-thread coordination of decimation tasks.
//!
//! Tasks run on their own threads and report through a channel as
//! [`TaskEvent`]s. Whoever owns a coordinator drains that channel with
//! `process_events` or `wait`; that thread is the only one that touches the
//! cached arrays and the only one that runs subscriber callbacks.

pub mod adhoc;
pub mod multi;
pub mod resolution;

use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

pub use adhoc::{AdhocDownsampler, RequestCallback, RequestId, RequestOutcome, ValuesCallback};
pub use multi::{LoadCallback, LoadStatus, MultiResolutionCoordinator};
pub use resolution::{ResolutionHandler, ResolutionToken, Subscriber};

use crate::audio::{AudioSource, TimeRange, TrackInfo};
use crate::cache::DecimatedRange;
use crate::decimate::task::DEFAULT_CHUNK_UNITS;
use crate::decimate::{DecimationTask, TaskOutcome};

/// Default clipping floor in dBFS.
pub const DEFAULT_FLOOR: f32 = -50.0;

/// How long `wait` blocks before checking for workers that died silently.
pub(crate) const WAIT_POLL: Duration = Duration::from_millis(50);

/// Tunables shared by the coordinator and the ad-hoc path.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoaderOptions {
    pub floor: f32,
    pub chunk_units: usize,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            floor: DEFAULT_FLOOR,
            chunk_units: DEFAULT_CHUNK_UNITS,
        }
    }
}

/// Messages from task threads to the owning thread.
#[derive(Debug)]
pub(crate) enum TaskEvent {
    Chunk {
        task_id: u64,
        rate: usize,
        range: DecimatedRange,
        values: Vec<f32>,
        last: bool,
        decibel_max: f32,
    },
    Finished {
        task_id: u64,
        outcome: TaskOutcome,
    },
}

/// Build a started task whose callbacks forward into `tx`.
///
/// A closed channel means the owner is gone, which stops the task.
pub(crate) fn spawn_task<S: AudioSource>(
    source: &Arc<S>,
    track: &Arc<TrackInfo>,
    range: TimeRange,
    rate: usize,
    options: &LoaderOptions,
    decibel_max: f32,
    tx: &Sender<TaskEvent>,
) -> DecimationTask<S> {
    let chunk_tx = tx.clone();
    let done_tx = tx.clone();
    let mut task = DecimationTask::new(
        Arc::clone(source),
        Arc::clone(track),
        range,
        rate,
        options.floor,
        decibel_max,
        Box::new(move |task, range, values, last| {
            chunk_tx
                .send(TaskEvent::Chunk {
                    task_id: task.id(),
                    rate: task.rate(),
                    range,
                    values,
                    last,
                    decibel_max: task.decibel_max(),
                })
                .is_ok()
        }),
    )
    .with_chunk_units(options.chunk_units)
    .on_complete(Box::new(move |task, outcome| {
        let _ = done_tx.send(TaskEvent::Finished {
            task_id: task.id(),
            outcome,
        });
    }));
    task.start();
    task
}
