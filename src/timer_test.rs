use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::timer::{TimerTask, TimingWheel};

/// Build a task which records its label into the given log when fired.
fn recording_task(log: &Arc<Mutex<Vec<&'static str>>>, delay_ms: u64, label: &'static str) -> TimerTask {
    let log = log.clone();
    TimerTask::new(delay_ms, move || {
        if let Ok(mut log) = log.lock() {
            log.push(label);
        }
    })
}

#[test]
fn zero_delay_task_fires_once_on_next_advance() -> Result<()> {
    let mut wheel = TimingWheel::new(20);
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    wheel.add(TimerTask::new(0, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }))
    .context("expected task to be scheduled")?;

    assert_eq!(count.load(Ordering::SeqCst), 0, "expected task not to fire synchronously on add");
    assert_eq!(wheel.size(), 1, "expected 1 pending task, got {}", wheel.size());

    let fired = wheel.advance_clock(1);
    assert_eq!(fired, 1, "expected 1 task to fire, got {}", fired);
    assert_eq!(count.load(Ordering::SeqCst), 1, "expected task to fire exactly once");

    let fired = wheel.advance_clock(100);
    assert_eq!(fired, 0, "expected no further firings, got {}", fired);
    assert_eq!(count.load(Ordering::SeqCst), 1, "expected task to fire exactly once");
    assert_eq!(wheel.size(), 0, "expected no pending tasks, got {}", wheel.size());
    Ok(())
}

#[test]
fn tasks_fire_in_due_order() -> Result<()> {
    let mut wheel = TimingWheel::new(20);
    let log = Arc::new(Mutex::new(vec![]));
    wheel.add(recording_task(&log, 250, "second")).context("expected task to be scheduled")?;
    wheel.add(recording_task(&log, 100, "first")).context("expected task to be scheduled")?;

    let fired = wheel.advance_clock(300);
    assert_eq!(fired, 2, "expected 2 tasks to fire, got {}", fired);
    let log = log.lock().map_err(|_| anyhow::anyhow!("poisoned log"))?;
    assert_eq!(*log, vec!["first", "second"], "expected tasks to fire in due order, got {:?}", *log);
    Ok(())
}

#[test]
fn tasks_do_not_fire_before_due() -> Result<()> {
    let mut wheel = TimingWheel::new(20);
    let log = Arc::new(Mutex::new(vec![]));
    wheel.add(recording_task(&log, 1000, "late")).context("expected task to be scheduled")?;

    let fired = wheel.advance_clock(999);
    assert_eq!(fired, 0, "expected no task to fire before due, got {}", fired);
    assert_eq!(wheel.size(), 1, "expected task to still be pending");

    let fired = wheel.advance_clock(1);
    assert_eq!(fired, 1, "expected task to fire once due, got {}", fired);
    Ok(())
}

#[test]
fn long_delays_cascade_through_levels() -> Result<()> {
    let mut wheel = TimingWheel::new(8);
    let log = Arc::new(Mutex::new(vec![]));
    let delays: [(u64, &'static str); 5] = [(3_600_000, "hour"), (5, "tiny"), (65, "small"), (600_000, "ten-min"), (4_000, "seconds")];
    for (delay, label) in delays {
        wheel.add(recording_task(&log, delay, label)).context("expected task to be scheduled")?;
    }

    let mut total = 0;
    for _ in 0..3_600 {
        total += wheel.advance_clock(1_000);
    }
    assert_eq!(total, 5, "expected all 5 tasks to fire, got {}", total);
    let log = log.lock().map_err(|_| anyhow::anyhow!("poisoned log"))?;
    assert_eq!(*log, vec!["tiny", "small", "seconds", "ten-min", "hour"], "unexpected firing order {:?}", *log);
    Ok(())
}

#[test]
fn same_due_time_fires_in_insertion_order() -> Result<()> {
    let mut wheel = TimingWheel::new(20);
    let log = Arc::new(Mutex::new(vec![]));
    for label in ["a", "b", "c"] {
        wheel.add(recording_task(&log, 50, label)).context("expected task to be scheduled")?;
    }
    wheel.advance_clock(50);
    let log = log.lock().map_err(|_| anyhow::anyhow!("poisoned log"))?;
    assert_eq!(*log, vec!["a", "b", "c"], "expected insertion order for equal due times, got {:?}", *log);
    Ok(())
}

#[test]
fn panicking_task_does_not_block_others() -> Result<()> {
    let mut wheel = TimingWheel::new(20);
    let log = Arc::new(Mutex::new(vec![]));
    wheel.add(TimerTask::new(10, || panic!("task failure"))).context("expected task to be scheduled")?;
    wheel.add(recording_task(&log, 20, "survivor")).context("expected task to be scheduled")?;

    let fired = wheel.advance_clock(30);
    assert_eq!(fired, 2, "expected both tasks to be fired, got {}", fired);
    let log = log.lock().map_err(|_| anyhow::anyhow!("poisoned log"))?;
    assert_eq!(*log, vec!["survivor"], "expected surviving task to fire, got {:?}", *log);
    Ok(())
}

#[test]
fn cancelled_task_never_fires() -> Result<()> {
    let mut wheel = TimingWheel::new(20);
    let log = Arc::new(Mutex::new(vec![]));
    let id = wheel.add(recording_task(&log, 10, "cancelled")).context("expected task to be scheduled")?;
    wheel.add(recording_task(&log, 10, "kept")).context("expected task to be scheduled")?;

    assert!(wheel.cancel(id), "expected cancel of a pending task to succeed");
    assert!(!wheel.cancel(id), "expected a second cancel to report nothing pending");
    let fired = wheel.advance_clock(10);
    assert_eq!(fired, 1, "expected only the kept task to fire, got {}", fired);
    let log = log.lock().map_err(|_| anyhow::anyhow!("poisoned log"))?;
    assert_eq!(*log, vec!["kept"], "unexpected fired tasks {:?}", *log);
    Ok(())
}

#[test]
fn shutdown_drops_pending_tasks() -> Result<()> {
    let mut wheel = TimingWheel::new(20);
    let count = Arc::new(AtomicUsize::new(0));
    for delay in [0, 10, 10_000] {
        let counter = count.clone();
        wheel.add(TimerTask::new(delay, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
    }

    wheel.shutdown();
    assert_eq!(wheel.size(), 0, "expected no pending tasks after shutdown, got {}", wheel.size());
    assert_eq!(wheel.advance_clock(20_000), 0, "expected nothing to fire after shutdown");
    assert!(wheel.add(TimerTask::new(0, || {})).is_none(), "expected add to be rejected after shutdown");
    assert_eq!(count.load(Ordering::SeqCst), 0, "expected dropped tasks never to fire");
    Ok(())
}
