//! Fixed pool of long-lived forecast reader threads.
//!
//! Callers hand a read request to the pool over a bounded channel and wait on a per-request
//! reply channel until a deadline. A hung source ties up at most `threads` workers; once they
//! are all busy and the queue is full, further reads time out without spawning anything.

use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded};

use crate::core::errors::{CadenceError, Result};
use crate::forecast::cache::{CachedForecast, ForecastCacheReader};

/// Result of one bounded read.
#[derive(Debug, Clone, PartialEq)]
pub enum PooledRead {
    Ready(Option<CachedForecast>),
    TimedOut,
}

struct ReadRequest {
    now: DateTime<Utc>,
    deadline: Instant,
    reply: Sender<Result<Option<CachedForecast>>>,
}

/// Long-lived workers in front of a [`ForecastCacheReader`].
///
/// Workers exit once the pool (the only request sender) is dropped and any in-flight read
/// returns.
pub struct ForecastReadPool {
    requests: Sender<ReadRequest>,
    workers: usize,
}

impl ForecastReadPool {
    /// Start up to `threads` workers (at least one is attempted).
    pub fn new(reader: ForecastCacheReader, threads: usize) -> Self {
        let threads = threads.max(1);
        let (tx, rx) = bounded::<ReadRequest>(threads);
        let mut workers = 0;
        for i in 0..threads {
            let reader = reader.clone();
            let rx = rx.clone();
            let spawned = thread::Builder::new()
                .name(format!("cadence-forecast-{i}"))
                .spawn(move || serve(&reader, &rx));
            match spawned {
                Ok(_) => workers += 1,
                Err(e) => eprintln!("[CADENCE-FORECAST] failed to spawn reader thread {i}: {e}"),
            }
        }
        Self {
            requests: tx,
            workers,
        }
    }

    /// Number of worker threads actually running.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Read the cache as of `now`, giving up after `timeout`.
    ///
    /// Both queueing and the read itself count against `timeout`.
    pub fn read(&self, now: DateTime<Utc>, timeout: Duration) -> Result<PooledRead> {
        let deadline = Instant::now() + timeout;
        let (reply, answer) = bounded(1);
        let request = ReadRequest {
            now,
            deadline,
            reply,
        };

        match self.requests.send_timeout(request, remaining(deadline)) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => return Ok(PooledRead::TimedOut),
            Err(SendTimeoutError::Disconnected(_)) => {
                return Err(CadenceError::ChannelClosed {
                    component: "forecast_reader",
                });
            }
        }

        match answer.recv_timeout(remaining(deadline)) {
            Ok(result) => result.map(PooledRead::Ready),
            Err(RecvTimeoutError::Timeout) => Ok(PooledRead::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(CadenceError::ChannelClosed {
                component: "forecast_reader",
            }),
        }
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn serve(reader: &ForecastCacheReader, requests: &Receiver<ReadRequest>) {
    while let Ok(request) = requests.recv() {
        // Caller already gave up while this sat in the queue.
        if Instant::now() >= request.deadline {
            continue;
        }
        let _ = request.reply.send(reader.get_cached_forecast(request.now));
    }
}
