// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runs "decode tile, paste into canvas" jobs, sequentially or on a bounded
//! pool of scoped worker threads.
//!
//! Jobs are handed out in row-major order. Cancellation and the first failure
//! stop new jobs from being handed out; jobs already running are always
//! drained before returning, so no work outlives the call.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use enough::Stop;
use log::debug;

use crate::container::ItemId;
use crate::{Error, Result};

/// One tile of a grid, and where it goes on the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TileJob {
    /// Row-major position in the tile reference list
    pub(crate) index: usize,
    pub(crate) tile: ItemId,
    pub(crate) x0: u32,
    pub(crate) y0: u32,
}

/// A poisoned lock means some worker panicked; that is never a tile's fault.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| Error::Poisoned)
}

/// Run `job_fn` for every job, at most `max_threads` at a time (0 = on this thread, in order).
///
/// `stop` is polled before each job is admitted. The first error wins; later
/// ones from jobs that were already running are dropped.
pub(crate) fn run_jobs<F>(jobs: &[TileJob], max_threads: u32, stop: &(dyn Stop + Sync), job_fn: F) -> Result<()>
where
    F: Fn(&TileJob) -> Result<()> + Sync,
{
    if max_threads == 0 || jobs.len() <= 1 {
        debug!("Decoding {} tiles sequentially", jobs.len());
        for job in jobs {
            stop.check()?;
            job_fn(job)?;
        }
        return Ok(());
    }

    let workers = jobs.len().min(max_threads as usize);
    debug!("Decoding {} tiles on {workers} threads", jobs.len());

    let queue = Mutex::new(jobs.iter().collect::<VecDeque<_>>());
    let error = Mutex::new(None);
    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| tile_worker(&queue, &error, stop, &job_fn));
        }
    });

    match error.into_inner() {
        Ok(Some(err)) => Err(err),
        Ok(None) => Ok(()),
        Err(_) => Err(Error::Poisoned),
    }
}

fn tile_worker<F>(queue: &Mutex<VecDeque<&TileJob>>, error: &Mutex<Option<Error>>, stop: &(dyn Stop + Sync), job_fn: &F)
where
    F: Fn(&TileJob) -> Result<()> + Sync,
{
    loop {
        if has_error(error) {
            break;
        }

        let job = match admit_next(queue, stop) {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(err) => {
                set_error(error, err);
                break;
            },
        };

        if let Err(err) = job_fn(job) {
            set_error(error, err);
            break;
        }
    }
}

/// Cancellation is checked under the queue lock so no job is admitted after a stop is seen.
fn admit_next<'a>(queue: &Mutex<VecDeque<&'a TileJob>>, stop: &(dyn Stop + Sync)) -> Result<Option<&'a TileJob>> {
    let mut queue = lock(queue)?;
    if queue.is_empty() {
        return Ok(None);
    }
    stop.check()?;
    Ok(queue.pop_front())
}

fn has_error(error: &Mutex<Option<Error>>) -> bool {
    lock(error).map(|slot| slot.is_some()).unwrap_or(true)
}

fn set_error(error: &Mutex<Option<Error>>, err: Error) {
    if let Ok(mut slot) = lock(error) {
        slot.get_or_insert(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enough::{StopReason, Unstoppable};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn jobs(count: usize) -> std::vec::Vec<TileJob> {
        (0..count)
            .map(|index| TileJob { index, tile: index as ItemId + 1, x0: 0, y0: 0 })
            .collect()
    }

    /// Stops once `after` checks have passed.
    struct StopAfter {
        checks: AtomicUsize,
        after: usize,
    }

    impl Stop for StopAfter {
        fn check(&self) -> Result<(), StopReason> {
            if self.checks.fetch_add(1, Ordering::SeqCst) >= self.after {
                Err(StopReason::Cancelled)
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn sequential_runs_in_order() {
        let order = Mutex::new(std::vec::Vec::new());
        run_jobs(&jobs(5), 0, &Unstoppable, |job| {
            order.lock().unwrap().push(job.index);
            Ok(())
        })
        .unwrap();
        assert_eq!(order.into_inner().unwrap(), [0, 1, 2, 3, 4]);
    }

    #[test]
    fn sequential_stops_at_first_error() {
        let ran = AtomicUsize::new(0);
        let result = run_jobs(&jobs(5), 0, &Unstoppable, |job| {
            ran.fetch_add(1, Ordering::SeqCst);
            if job.index == 2 { Err(Error::Codec("bad tile".into())) } else { Ok(()) }
        });
        assert_eq!(result, Err(Error::Codec("bad tile".into())));
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn parallel_never_exceeds_limit() {
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let ran = AtomicUsize::new(0);
        run_jobs(&jobs(24), 3, &Unstoppable, |_| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(2));
            running.fetch_sub(1, Ordering::SeqCst);
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 24);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn parallel_drains_running_jobs_before_reporting() {
        let finished = AtomicBool::new(false);
        let started = AtomicUsize::new(0);
        let result = run_jobs(&jobs(40), 2, &Unstoppable, |job| {
            started.fetch_add(1, Ordering::SeqCst);
            if job.index == 0 {
                std::thread::sleep(Duration::from_millis(30));
                finished.store(true, Ordering::SeqCst);
                Ok(())
            } else {
                Err(Error::Codec("bad tile".into()))
            }
        });
        assert_eq!(result, Err(Error::Codec("bad tile".into())));
        assert!(finished.load(Ordering::SeqCst));
        assert!(started.load(Ordering::SeqCst) < 40);
    }

    #[test]
    fn poisoned_lock_is_fatal() {
        let shared = Mutex::new(0u32);
        let panicked = std::thread::scope(|s| {
            s.spawn(|| {
                let _guard = shared.lock().unwrap();
                panic!("tile decoder crashed");
            })
            .join()
            .is_err()
        });
        assert!(panicked);
        let err = lock(&shared).unwrap_err();
        assert_eq!(err, Error::Poisoned);
        assert!(err.is_always_fatal());
    }

    #[test]
    fn cancellation_stops_admission() {
        for threads in [0, 4] {
            let stop = StopAfter { checks: AtomicUsize::new(0), after: 3 };
            let ran = AtomicUsize::new(0);
            let result = run_jobs(&jobs(10), threads, &stop, |_| {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            assert_eq!(result, Err(Error::Stopped(StopReason::Cancelled)));
            assert_eq!(ran.load(Ordering::SeqCst), 3);
        }
    }
}
