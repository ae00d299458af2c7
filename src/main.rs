mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use cli::{Cli, DEFAULT_RATE};
use waveline::config;
use waveline::coordinator::DEFAULT_FLOOR;
use waveline::decimate::task::DEFAULT_CHUNK_UNITS;
use waveline::decimate::to_decimated;
use waveline::{
    DecimatedRange, DirCacheStore, LoadStatus, MultiResolutionCoordinator, RequestOutcome,
    SymphoniaSource, TimeRange,
};

#[derive(Serialize)]
struct Report {
    track: TrackReport,
    floor: f32,
    decibel_max: f32,
    resolutions: Vec<ResolutionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    range: Option<RangeReport>,
}

#[derive(Serialize)]
struct TrackReport {
    path: String,
    sample_rate: u32,
    channels: u16,
    frames: u64,
    duration: f64,
}

#[derive(Serialize)]
struct ResolutionReport {
    rate: usize,
    values: Vec<f32>,
}

#[derive(Serialize)]
struct RangeReport {
    rate: usize,
    start: f64,
    end: f64,
    first_index: usize,
    outcome: String,
    values: Vec<f32>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let mut cli = Cli::parse();

    // Explicit --config path, or auto-detect waveline.toml / user config
    let config_path = cli.config.clone().or_else(config::find_config);
    if let Some(ref path) = config_path {
        if let Some(cfg) = config::load_config(path) {
            log::info!("Loaded config from {}", path.display());
            // Config values apply only when the CLI is at its default
            if cli.rates.is_empty() { cli.rates = cfg.decimation.rates; }
            if cli.floor == DEFAULT_FLOOR { cli.floor = cfg.decimation.floor; }
            if cli.chunk_units == DEFAULT_CHUNK_UNITS { cli.chunk_units = cfg.decimation.chunk_units; }
            if !cfg.cache.enabled { cli.no_cache = true; }
            if cli.cache_dir.is_none() { cli.cache_dir = cfg.cache.dir; }
        } else {
            log::warn!("Failed to load config from {}", path.display());
        }
    }

    if !cli.input.exists() {
        anyhow::bail!("Input file not found: {}", cli.input.display());
    }
    cli.rates.retain(|&r| r > 0);
    if cli.rates.is_empty() {
        cli.rates.push(DEFAULT_RATE);
    }
    cli.rates.sort_unstable();
    cli.rates.dedup();

    let options = config::DecimationConfig {
        floor: cli.floor,
        chunk_units: cli.chunk_units,
        rates: cli.rates.clone(),
    }
    .loader_options();

    let id = cli.input.to_string_lossy().into_owned();
    let source = Arc::new(SymphoniaSource::new());
    let mut coord = MultiResolutionCoordinator::open(source, &id, options)
        .with_context(|| format!("Failed to open {}", cli.input.display()))?;

    if !cli.no_cache {
        let store = match cli.cache_dir.clone() {
            Some(dir) => Some(DirCacheStore::new(dir)),
            None => DirCacheStore::default_location(),
        };
        if let Some(store) = store {
            log::info!("Waveform cache: {}", store.dir().display());
            coord = coord.with_store(Box::new(store));
        }
    }

    let track = coord.track().clone();
    log::info!("Input: {}", cli.input.display());
    log::info!(
        "{} Hz, {} channels, {:.2}s, rates {:?}, floor {} dB",
        track.sample_rate,
        track.channels,
        track.duration,
        cli.rates,
        options.floor
    );

    for &rate in &cli.rates {
        coord
            .add_resolution(rate, Box::new(|_, _| {}))
            .with_context(|| format!("Invalid rate {}", rate))?;
    }

    // 1. Full-track load at the finest rate
    coord.start_loading();
    let pb = ProgressBar::new(1000);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {percent}% ({eta} remaining)")?
            .progress_chars("=>-"),
    );
    while coord.status() == LoadStatus::Loading {
        coord.wait_step();
        pb.set_position((coord.progress() * 1000.0) as u64);
    }
    match coord.status() {
        LoadStatus::Loaded => pb.finish_with_message("Decimation complete"),
        status => {
            pb.abandon();
            anyhow::bail!("Loading {} ended with status {:?}", cli.input.display(), status);
        }
    }

    // 2. Optional on-demand range
    let range = match (cli.start, cli.end) {
        (Some(start), Some(end)) => {
            let rate = cli.range_rate.unwrap_or(cli.rates[0]);
            Some(request_range(&mut coord, rate, TimeRange::new(start, end))?)
        }
        _ => None,
    };

    let resolutions = cli
        .rates
        .iter()
        .filter_map(|&rate| {
            coord.values(rate).map(|values| ResolutionReport {
                rate,
                values: values.to_vec(),
            })
        })
        .collect();

    let report = Report {
        track: TrackReport {
            path: id,
            sample_rate: track.sample_rate,
            channels: track.channels,
            frames: track.total_samples,
            duration: track.duration,
        },
        floor: options.floor,
        decibel_max: coord.decibel_max(),
        resolutions,
        range,
    };

    match cli.output {
        Some(ref path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            serde_json::to_writer_pretty(std::io::BufWriter::new(file), &report)?;
            log::info!("Done! Output: {}", path.display());
        }
        None => {
            let stdout = std::io::stdout();
            serde_json::to_writer_pretty(stdout.lock(), &report)?;
            println!();
        }
    }
    Ok(())
}

fn request_range(
    coord: &mut MultiResolutionCoordinator<SymphoniaSource>,
    rate: usize,
    range: TimeRange,
) -> Result<RangeReport> {
    let parts: Rc<RefCell<Vec<(DecimatedRange, Vec<f32>)>>> = Rc::new(RefCell::new(Vec::new()));
    let outcome: Rc<RefCell<Option<RequestOutcome>>> = Rc::new(RefCell::new(None));

    let sink = Rc::clone(&parts);
    let done = Rc::clone(&outcome);
    coord
        .request(
            rate,
            range,
            Box::new(move |r, v| sink.borrow_mut().push((r, v.to_vec()))),
            Box::new(move |o| *done.borrow_mut() = Some(o)),
        )
        .with_context(|| format!("Empty range {:.3}s..{:.3}s at rate {}", range.start, range.end, rate))?;
    coord.wait();

    let wanted = to_decimated(coord.track(), &range, rate);
    let values = assemble(wanted, parts.take(), coord.options().floor);
    let first_index = wanted.lower;

    let outcome = outcome.take().unwrap_or(RequestOutcome::Incomplete);
    if outcome != RequestOutcome::Completed {
        log::warn!("Range request ended {:?} with {} values", outcome, values.len());
    }
    Ok(RangeReport {
        rate,
        start: range.start,
        end: range.end,
        first_index,
        outcome: format!("{:?}", outcome),
        values,
    })
}

/// Lay delivered parts out over `wanted`, leaving the floor in slots nothing
/// arrived for. Trailing slots past the last delivered value are dropped, so a
/// track shorter than declared does not report phantom values.
fn assemble(wanted: DecimatedRange, parts: Vec<(DecimatedRange, Vec<f32>)>, floor: f32) -> Vec<f32> {
    let mut values = vec![floor; wanted.len()];
    let mut filled = 0;
    for (range, v) in parts {
        let Some(part) = range.intersection(&wanted) else {
            continue;
        };
        let src = &v[part.lower - range.lower..part.upper - range.lower];
        values[part.lower - wanted.lower..part.upper - wanted.lower].copy_from_slice(src);
        filled = filled.max(part.upper - wanted.lower);
    }
    values.truncate(filled);
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gaps_are_padded_with_floor() {
        let parts = vec![
            (DecimatedRange::new(12, 14), vec![-1.0, -2.0]),
            (DecimatedRange::new(10, 11), vec![-3.0]),
        ];
        let values = assemble(DecimatedRange::new(10, 16), parts, -50.0);
        assert_eq!(values, vec![-3.0, -50.0, -1.0, -2.0]);
    }

    #[test]
    fn overlapping_parts_keep_alignment() {
        let parts = vec![
            (DecimatedRange::new(8, 12), vec![-8.0, -9.0, -10.0, -11.0]),
            (DecimatedRange::new(10, 13), vec![-10.0, -11.0, -12.0]),
        ];
        let values = assemble(DecimatedRange::new(10, 13), parts, -50.0);
        assert_eq!(values, vec![-10.0, -11.0, -12.0]);
        assert!(assemble(DecimatedRange::new(0, 4), Vec::new(), -50.0).is_empty());
    }
}
