// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use clap::{Args, Parser, Subcommand, ValueEnum};
use crossbeam::channel::bounded;
use fileq::{
    Confirmer, ConsumerOptions, FileQueueBuilder, HashAlgorithm, InitPosition, Message,
    QueueRegistry, ThreadPool, consume_state::read_cursor, path::cursor_path,
    path::scan_segments, recovery::verify_segment,
};
use fileq_common_telemetry::{LoggingOptions, init_global_logging, set_panic_hook};
use snafu::{ResultExt, Whatever, whatever};

#[derive(Debug, Parser)]
#[clap(
name = "fileq",
about = "Inspect and benchmark file-backed queues",
author = env!("CARGO_PKG_AUTHORS"),
version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Log filter, e.g. `info` or `fileq=debug`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Inspect(InspectArgs),
    Cursor(CursorArgs),
    Bench(BenchArgs),
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum HashArg {
    #[default]
    Rolling,
    Crc32,
}

impl From<HashArg> for HashAlgorithm {
    fn from(arg: HashArg) -> Self {
        match arg {
            HashArg::Rolling => Self::Rolling,
            HashArg::Crc32 => Self::Crc32,
        }
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

List the segments of a queue with frame counts and checksum failures.
Examples:

fileq inspect --dir ./queue_data --name orders

")]
struct InspectArgs {
    #[arg(long)]
    dir:  PathBuf,
    #[arg(long)]
    name: String,
    /// Checksum algorithm the queue was written with.
    #[arg(long, value_enum, default_value_t)]
    hash: HashArg,
}

impl InspectArgs {
    fn run(&self) -> Result<(), Whatever> {
        let segments = scan_segments(&self.dir, &self.name)
            .with_whatever_context(|_| format!("failed to scan {}", self.dir.display()))?;
        if segments.is_empty() {
            println!("no segments for queue {} in {}", self.name, self.dir.display());
            return Ok(());
        }

        println!(
            "{:>8} {:>6} {:>10} {:>8} {:>8} {:>8} {:>12} {:>6}",
            "file_no", "header", "frames", "hashed", "bad_sum", "oversize", "bytes", "torn"
        );
        let mut failures = 0;
        for (file_no, path) in segments {
            let report = verify_segment(&path, file_no, self.hash.into())
                .with_whatever_context(|_| format!("failed to read {}", path.display()))?;
            failures += report.checksum_failures;
            println!(
                "{:>8} {:>6} {:>10} {:>8} {:>8} {:>8} {:>12} {:>6}",
                report.file_no,
                if report.header_ok { "ok" } else { "BAD" },
                report.frames,
                report.hashed_frames,
                report.checksum_failures,
                report.oversized_frames,
                report.bytes,
                report.torn_tail,
            );
        }
        if failures > 0 {
            whatever!("{failures} frames failed checksum verification");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Print the durable cursor of a consumer.
Examples:

fileq cursor --dir ./queue_data --name orders --consumer audit

")]
struct CursorArgs {
    #[arg(long)]
    dir:      PathBuf,
    #[arg(long)]
    name:     String,
    #[arg(long)]
    consumer: String,
}

impl CursorArgs {
    fn run(&self) -> Result<(), Whatever> {
        let path = cursor_path(&self.dir, &self.name, &self.consumer);
        let cursor = read_cursor(&path)
            .with_whatever_context(|_| format!("failed to read {}", path.display()))?;
        match cursor {
            Some(cursor) => println!(
                "{}: file_no={} read_pos={}",
                path.display(),
                cursor.file_no,
                cursor.read_pos
            ),
            None => whatever!("{} is not a valid cursor file", path.display()),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Push messages into a fresh queue, then consume them with K consumers and report
throughput.
Examples:

fileq bench --dir /tmp/fileq-bench --messages 1000000 --consumers 4

")]
struct BenchArgs {
    #[arg(long)]
    dir:          PathBuf,
    #[arg(long, default_value = "bench")]
    name:         String,
    #[arg(long, default_value_t = 100_000)]
    messages:     u64,
    #[arg(long, default_value_t = 1)]
    consumers:    usize,
    #[arg(long, default_value_t = 128)]
    size:         usize,
    #[arg(long)]
    sequential:   bool,
    #[arg(long)]
    checked:      bool,
    #[arg(long)]
    buffered:     bool,
    #[arg(long, default_value_t = 4)]
    threads:      usize,
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

impl BenchArgs {
    fn run(&self) -> Result<(), Whatever> {
        let pool = ThreadPool::new("fileq-bench", self.threads).whatever_context("thread pool")?;
        let registry = QueueRegistry::start(Arc::new(pool)).whatever_context("dispatcher")?;
        let queue = registry
            .create(
                FileQueueBuilder::new(&self.dir, &self.name)
                    .buffered_push(self.buffered)
                    .buffered_poll(self.buffered),
            )
            .whatever_context("open queue")?;

        let payload = vec![b'x'; self.size];
        let started = Instant::now();
        for _ in 0..self.messages {
            queue
                .push_with(&payload, self.checked)
                .whatever_context("push")?;
        }
        queue.hasten();
        report("push", self.messages, started.elapsed());

        let expected = self.messages * self.consumers as u64;
        let received = Arc::new(AtomicU64::new(0));
        let (done_tx, done_rx) = bounded(1);
        let started = Instant::now();
        for i in 0..self.consumers {
            let received = Arc::clone(&received);
            let done_tx = done_tx.clone();
            let handler = move |_: &Message, _: &Confirmer| {
                if received.fetch_add(1, Ordering::Relaxed) + 1 == expected {
                    let _ = done_tx.try_send(());
                }
                true
            };
            let options = ConsumerOptions::new(format!("bench-{i}"))
                .sequential(self.sequential)
                .position(InitPosition::Head);
            queue
                .add_consumer(options, handler)
                .whatever_context("add consumer")?;
        }

        let finished = done_rx.recv_timeout(Duration::from_secs(self.timeout_secs));
        let elapsed = started.elapsed();
        let consumed = received.load(Ordering::Relaxed);
        registry.stop();
        if finished.is_err() {
            whatever!("timed out: consumed {consumed} of {expected}");
        }
        report("consume", consumed, elapsed);
        Ok(())
    }
}

#[allow(clippy::cast_precision_loss)]
fn report(phase: &str, count: u64, elapsed: Duration) {
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    println!(
        "{phase}: {count} msgs in {:.3}s, {:.0} msgs/s",
        secs,
        count as f64 / secs
    );
}

fn main() -> Result<(), Whatever> {
    let cli = Cli::parse();
    let opts = LoggingOptions::builder()
        .maybe_level(cli.log_level.clone().or_else(|| Some("warn".to_string())))
        .build();
    let _guards = init_global_logging("fileq", &opts);
    set_panic_hook();

    match cli.commands {
        Commands::Inspect(args) => args.run(),
        Commands::Cursor(args) => args.run(),
        Commands::Bench(args) => args.run(),
    }
}
