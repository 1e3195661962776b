//! Fixed-size worker pool over a bounded work queue
//!
//! One pool per pipeline stage: a bounded crossbeam channel for
//! backpressure, scoped worker threads, an explicit join, and a single
//! first-error-wins propagation path. A failed worker stops consuming; once
//! every receiver is gone the producer's `send` fails and it stops too.

use anyhow::Result;
use crossbeam_channel::{bounded, Sender};
use std::sync::Mutex;

/// Run `producer` on the calling thread feeding a bounded queue consumed by
/// `workers` threads running `work`. Returns the first error raised by the
/// producer or any worker.
///
/// The producer should treat a failed `send` as a signal to stop: it means
/// every worker has exited (first error already captured).
pub fn run_stage<T, P, W>(workers: usize, capacity: usize, producer: P, work: W) -> Result<()>
where
    T: Send,
    P: FnOnce(&Sender<T>) -> Result<()>,
    W: Fn(T) -> Result<()> + Sync,
{
    assert!(workers > 0, "stage needs at least one worker");
    let (tx, rx) = bounded::<T>(capacity);
    let first_error: Mutex<Option<anyhow::Error>> = Mutex::new(None);

    let producer_result = std::thread::scope(|s| {
        for _ in 0..workers {
            let rx = rx.clone();
            let first_error = &first_error;
            let work = &work;
            s.spawn(move || {
                while let Ok(item) = rx.recv() {
                    if let Err(err) = work(item) {
                        let mut slot = first_error.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                        return;
                    }
                }
            });
        }
        drop(rx);
        let result = producer(&tx);
        drop(tx);
        result
        // Scope exit joins every worker.
    });

    if let Some(err) = first_error.into_inner().unwrap() {
        return Err(err);
    }
    producer_result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_all_items_processed() {
        let processed = AtomicU64::new(0);
        run_stage(
            4,
            8,
            |tx| {
                for i in 0..1000u64 {
                    if tx.send(i).is_err() {
                        break;
                    }
                }
                Ok(())
            },
            |_item| {
                processed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(processed.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn test_first_error_wins() {
        let err = run_stage(
            2,
            4,
            |tx| {
                for i in 0..100u64 {
                    if tx.send(i).is_err() {
                        break;
                    }
                }
                Ok(())
            },
            |item| {
                if item == 7 {
                    anyhow::bail!("worker failed on item {}", item)
                }
                Ok(())
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("item 7"));
    }

    #[test]
    fn test_producer_error_propagates() {
        let err = run_stage(
            2,
            4,
            |tx| {
                tx.send(1u64).ok();
                anyhow::bail!("producer gave up")
            },
            |_item| Ok(()),
        )
        .unwrap_err();
        assert!(err.to_string().contains("producer gave up"));
    }
}
