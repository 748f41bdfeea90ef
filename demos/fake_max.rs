// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Fake global maximization, computed once with a range launch and once with
//! individual launches. Both must find the same maximum.

use clap::{Parser, ValueEnum};
use spawnring::{
    AnyEngine, CpuPinningPolicy, Engine, EngineBuilder, EngineMode, SlotCount, WorkerContext,
};
use std::num::NonZeroUsize;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Overall maximum for the default parameters.
const FAKE_GLOBAL_MAX: u64 = 0xFDFF_D009_862C_72FD;

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    let items = cli.items.get();

    let shared = FakeMax::new(items);
    let mut engine = match (EngineBuilder {
        mode: match cli.mode {
            ModeCli::Multi => EngineMode::Multi,
            ModeCli::Mono => EngineMode::Mono,
        },
        slots: SlotCount::Count(cli.slots),
        cpu_pinning: if cli.pin_threads {
            CpuPinningPolicy::IfSupported
        } else {
            CpuPinningPolicy::No
        },
        thread_name: Some("fake-max".to_owned()),
        stack_size: None,
    })
    .build(fake_max as FakeWorker, shared.clone())
    {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Failed to create the engine: {e}");
            return ExitCode::FAILURE;
        }
    };
    println!(
        "Running {} items with a concurrency bound of {}",
        items,
        engine.concurrency_bound()
    );

    let result = engine.launch_range(items - 1);
    // Outstanding threads must be retired whatever happened.
    engine.retire_all();
    if let Err(e) = result {
        eprintln!("launch_range() failed: {e}");
        return ExitCode::FAILURE;
    }
    report("launch_range", shared.global_max(), items);

    // Same computation, with one launch per item.
    let shared = FakeMax::new(items);
    engine.rewind(fake_max, shared.clone());
    if let Err(e) = launch_each(&mut engine, items) {
        engine.retire_all();
        eprintln!("launch_one() failed: {e}");
        return ExitCode::FAILURE;
    }
    engine.retire_all();
    report("launch_one", shared.global_max(), items);

    println!("{:?}", engine.stats());
    engine.free();
    ExitCode::SUCCESS
}

fn launch_each(
    engine: &mut AnyEngine<FakeMax, u32, FakeWorker>,
    items: usize,
) -> Result<(), spawnring::LaunchError> {
    for i in 0..items {
        engine.launch_one(i)?;
    }
    Ok(())
}

fn report(method: &str, global_max: u64, items: usize) {
    println!("{method}: fake global max = {global_max:016X}");
    if items == 1843 {
        if global_max == FAKE_GLOBAL_MAX {
            println!("^ Correct!");
        } else {
            println!("^ Wrong!");
        }
    }
}

/// Read-only table shared by all the work items, and one output per item.
struct FakeMax {
    data: Vec<u16>,
    maxima: Vec<AtomicU64>,
}

impl FakeMax {
    fn new(num_items: usize) -> Arc<Self> {
        Arc::new(Self {
            data: (0..39).map(|i: u16| i * i * i).collect(),
            maxima: (0..num_items).map(|_| AtomicU64::new(0)).collect(),
        })
    }

    fn global_max(&self) -> u64 {
        self.maxima
            .iter()
            .map(|x| x.load(Ordering::Relaxed))
            .max()
            .unwrap_or(0)
    }
}

type FakeWorker = fn(&WorkerContext<'_, FakeMax>, &mut u32);

/// Iterates a recurrence seeded with the item index over the table, and records
/// the largest value reached. The scratch space of the slot holds a running
/// sum of the table.
fn fake_max(context: &WorkerContext<'_, FakeMax>, scratch: &mut u32) {
    let shared = context.shared();
    *scratch = 0;
    let mut x = context.item_index() as u64;
    let mut x_max = 0;
    for &value in &shared.data {
        x = 0xFE00_1000 * (x as u32 as u64) + (x >> 32) + u64::from(value);
        x_max = x_max.max(x);
        *scratch += u32::from(value);
    }
    x_max |= u64::from(*scratch);
    shared.maxima[context.item_index()].store(x_max, Ordering::Relaxed);
}

/// Fake global maximization over a bounded number of threads.
#[derive(Parser, Debug, PartialEq, Eq)]
#[command(version)]
struct Cli {
    /// Number of work items.
    #[arg(long, default_value = "1843")]
    items: NonZeroUsize,

    /// Number of slots, i.e. maximum number of threads in flight.
    #[arg(long, default_value = "320")]
    slots: NonZeroUsize,

    /// Realization of the engine.
    #[arg(long, value_enum, default_value_t = ModeCli::Multi)]
    mode: ModeCli,

    /// Whether to pin the threads of each slot to a CPU.
    #[arg(long, default_value_t = false)]
    pin_threads: bool,
}

/// Realization of the engine.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ModeCli {
    /// One OS thread per work item.
    Multi,
    /// All work items on the main thread.
    Mono,
}
