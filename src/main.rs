//! diskq-bench: mixed overlapping read/write workload
//!
//! Usage: diskq-bench [path] [auto|aio|uring|pooled] [ops] [seed]
//!
//! Every read checks that it observes the last write submitted before it to
//! each block it covers, which only holds if overlapping requests run in
//! submission order.

use std::cell::RefCell;
use std::env;
use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use diskq::io::{AlignedBuffer, PollLoop, BLOCK_SIZE};
use diskq::{Completion, IoMode, OpKind, Request, Scheduler, SchedulerConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

/// Blocks in the test file
const FILE_BLOCKS: u64 = 256;

/// Requests kept outstanding at once
const WINDOW: usize = 512;

/// Per-block fill byte expected by a read
type Expected = Vec<u8>;

fn select_mode(name: &str, config: &SchedulerConfig) -> Result<IoMode, Box<dyn std::error::Error>> {
    let mode = match name {
        "aio" => IoMode::linux_aio(config)?,
        "uring" => IoMode::uring(config)?,
        "pooled" => IoMode::Pooled { workers: 8 },
        "auto" => match IoMode::linux_aio(config) {
            Ok(mode) => mode,
            Err(e) => {
                tracing::warn!(error = %e, "kernel AIO unavailable, trying io_uring");
                match IoMode::uring(config) {
                    Ok(mode) => mode,
                    Err(e) => {
                        tracing::warn!(error = %e, "io_uring unavailable, using worker pool");
                        IoMode::Pooled { workers: 8 }
                    }
                }
            }
        },
        other => return Err(format!("unknown mode {other:?}").into()),
    };
    Ok(mode)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();

    let path = args
        .get(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./diskq-bench.dat"));

    let mode_name = args.get(2).map(String::as_str).unwrap_or("auto");

    let ops: usize = args
        .get(3)
        .and_then(|s| s.parse().ok())
        .unwrap_or(100_000);

    let seed: u64 = args
        .get(4)
        .and_then(|s| s.parse().ok())
        .unwrap_or(42);

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;
    file.set_len(FILE_BLOCKS * BLOCK_SIZE)?;
    let fd = file.as_raw_fd();

    let config = SchedulerConfig::default();
    let mode = select_mode(mode_name, &config)?;
    tracing::info!(?path, ?mode, ops, seed, "Starting diskq-bench");

    let done: Rc<RefCell<Vec<Completion<Expected>>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = done.clone();
    let scheduler = Rc::new(RefCell::new(Scheduler::new(config, mode, move |c| {
        sink.borrow_mut().push(c)
    })?));

    let mut event_loop = PollLoop::new();
    Scheduler::attach(&scheduler, &mut event_loop)?;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut latest = vec![0u8; FILE_BLOCKS as usize];
    let mut generation = 0u8;
    let mut submitted = 0usize;
    let mut completed = 0usize;
    let mut mismatches = 0usize;
    let started = Instant::now();

    while completed < ops {
        while submitted < ops && submitted - completed < WINDOW {
            let first = rng.gen_range(0..FILE_BLOCKS - 1);
            let blocks = rng.gen_range(1..=2u64);
            let offset = first * BLOCK_SIZE;
            let len = (blocks * BLOCK_SIZE) as usize;
            let span = first as usize..(first + blocks) as usize;

            let request = if rng.gen_bool(0.4) {
                generation = generation.wrapping_add(1).max(1);
                latest[span].fill(generation);
                let mut buf = AlignedBuffer::new(len)?;
                buf.as_mut_slice().fill(generation);
                Request::write(fd, buf, offset, len, Vec::new())?
            } else {
                let expected = latest[span].to_vec();
                Request::read(fd, AlignedBuffer::new(len)?, offset, len, expected)?
            };
            scheduler.borrow_mut().submit(request);
            submitted += 1;
        }

        event_loop.turn(Some(Duration::from_millis(100)))?;

        for c in done.borrow_mut().drain(..) {
            completed += 1;
            if c.kind != OpKind::Read {
                continue;
            }
            let ok = c
                .buffer
                .chunks(BLOCK_SIZE as usize)
                .zip(&c.token)
                .all(|(block, &fill)| block.iter().all(|&b| b == fill));
            if !ok {
                mismatches += 1;
                tracing::error!(offset = c.offset, expected = ?c.token, "read observed stale data");
            }
        }
    }

    let elapsed = started.elapsed();
    scheduler.borrow().detach(&mut event_loop);
    let snapshot = scheduler.borrow().metrics().snapshot();
    tracing::info!(
        ops,
        mismatches,
        elapsed_ms = elapsed.as_millis() as u64,
        iops = (ops as f64 / elapsed.as_secs_f64()) as u64,
        metrics = ?snapshot,
        "diskq-bench finished"
    );

    if mismatches > 0 {
        return Err(format!("{mismatches} reads observed out-of-order data").into());
    }
    Ok(())
}
