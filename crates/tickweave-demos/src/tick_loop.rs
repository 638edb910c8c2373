//! Minimal tick-loop host driving a handful of routines.
//!
//! Run with `cargo run --bin tick_loop`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tickweave::{Phase, Scheduler, StepFn, SystemClock, YieldInstruction};

fn main() {
    env_logger::init();

    let scheduler = match Scheduler::create(Arc::new(SystemClock::new()), 2, 0.1) {
        Ok(scheduler) => scheduler,
        Err(err) => {
            log::error!("scheduler setup failed: {}", err);
            return;
        }
    };

    // Countdown: one message per second, entirely timer-driven.
    let mut remaining = 3;
    let countdown = scheduler.start_with_handle(StepFn::new(move || {
        if remaining == 0 {
            println!("countdown: liftoff");
            return None;
        }
        println!("countdown: {}", remaining);
        remaining -= 1;
        Some(YieldInstruction::after_seconds(1.0))
    }));

    // Background sum: migrate to a worker, crunch, come back, report.
    let total = Arc::new(AtomicU64::new(0));
    let crunched = total.clone();
    let mut step = 0;
    let sum = scheduler.start_with_handle(StepFn::new(move || {
        step += 1;
        match step {
            1 => Some(YieldInstruction::MoveToBackground),
            2 => {
                let sum: u64 = (1..=10_000_000).sum();
                crunched.store(sum, Ordering::Relaxed);
                Some(YieldInstruction::MoveToForeground)
            }
            _ => {
                println!("background sum: {}", crunched.load(Ordering::Relaxed));
                None
            }
        }
    }));

    // Nested delegation: the outer routine hands control to an inner one,
    // then resumes at end-of-frame once it finishes.
    let mut outer_step = 0;
    let nested = scheduler.start_with_handle(StepFn::new(move || {
        outer_step += 1;
        match outer_step {
            1 => {
                let mut ticks = 0;
                Some(YieldInstruction::nested(StepFn::new(move || {
                    ticks += 1;
                    if ticks <= 3 {
                        println!("inner: tick {}", ticks);
                        Some(YieldInstruction::at_phase(Phase::Update))
                    } else {
                        None
                    }
                })))
            }
            2 => Some(YieldInstruction::at_phase(Phase::EndOfFrame)),
            _ => {
                println!("outer: done");
                None
            }
        }
    }));

    // 60 Hz tick loop until everything completes.
    while !(countdown.is_completed() && sum.is_completed() && nested.is_completed()) {
        scheduler.on_update();
        scheduler.on_poll();
        scheduler.on_fixed_update();
        scheduler.on_late_update();
        scheduler.on_end_of_frame();
        thread::sleep(Duration::from_millis(16));
    }

    let stats = scheduler.stats();
    println!(
        "shutting down: {} shard(s), {} handle(s) outstanding",
        stats.shards, stats.outstanding_handles
    );
    scheduler.dispose();
}
