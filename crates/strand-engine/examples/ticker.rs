//! Ticker demo: a recurring timer, two sleeping coroutines and a signal
//! watcher sharing one kernel.
//!
//! Run with `RUST_LOG=strand_engine=debug cargo run --example ticker`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strand_engine::{Kernel, KernelConfig};
use tracing_subscriber::EnvFilter;

const SIGUSR1: i32 = 10;

fn main() -> strand_engine::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let kernel = Kernel::new(KernelConfig::from_env());

    let ticks = Arc::new(AtomicU32::new(0));
    let t = ticks.clone();
    kernel.repeat(
        move |canceller| {
            let n = t.fetch_add(1, Ordering::SeqCst) + 1;
            println!("tick {}", n);
            if n == 5 {
                canceller.cancel();
            }
            Ok(())
        },
        Duration::from_millis(100),
    );

    let mut workers = Vec::new();
    for (name, millis) in [("fast", 150u64), ("slow", 420)] {
        let k = kernel.clone();
        workers.push(kernel.spawn(move |_, _| {
            k.sleep(Duration::from_millis(millis))?;
            println!("{} worker woke up after {}ms", name, millis);
            Ok(millis)
        })?);
    }

    let watcher = kernel.on_signal(SIGUSR1, |signal| {
        println!("caught signal {}", signal);
        Ok(())
    });
    let k = kernel.clone();
    kernel.delay(
        move || {
            k.raise_signal(SIGUSR1);
            let k2 = k.clone();
            k.delay(
                move || {
                    k2.cancel(watcher);
                    Ok(())
                },
                Duration::from_millis(50),
            );
            Ok(())
        },
        Duration::from_millis(250),
    );

    kernel.run_default()?;

    let total: u64 = workers
        .iter()
        .map(|worker| kernel.await_future(worker))
        .sum::<strand_engine::Result<u64>>()?;
    println!("{} ticks, workers slept {}ms in total", ticks.load(Ordering::SeqCst), total);
    Ok(())
}
