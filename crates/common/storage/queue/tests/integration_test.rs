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
    fs::OpenOptions,
    io::{Seek, SeekFrom, Write},
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crossbeam::channel::{Receiver, Sender, unbounded};
use fileq::{
    Confirmer, ConsumerOptions, DispatcherConfig, FileQueue, FileQueueBuilder, HashAlgorithm,
    InitPosition, Message, QueueError, QueueRegistry, RetryPolicy, ThreadPool, path::segment_path,
};
use fileq_common_telemetry::init_default_ut_logging;
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(5);

fn registry() -> QueueRegistry {
    init_default_ut_logging();
    let pool = Arc::new(ThreadPool::new("it-handler", 4).unwrap());
    QueueRegistry::with_config(
        pool,
        DispatcherConfig {
            idle_wait: Duration::from_millis(20),
        },
    )
    .unwrap()
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        min_interval:     Duration::from_millis(5),
        max_interval:     Duration::from_millis(20),
        max_failed_times: 10,
    }
}

/// Forwards every delivery to a channel and confirms with `true`.
fn recorder(tx: Sender<Message>) -> impl Fn(&Message, &Confirmer) -> bool + Send + Sync + 'static {
    move |msg: &Message, _: &Confirmer| {
        let _ = tx.send(msg.clone());
        true
    }
}

fn recv_payloads(rx: &Receiver<Message>, n: usize) -> Vec<Vec<u8>> {
    (0..n)
        .map(|_| rx.recv_timeout(TIMEOUT).unwrap().payload().to_vec())
        .collect()
}

fn add_head_consumer(queue: &FileQueue, name: &str, sequential: bool) -> Receiver<Message> {
    let (tx, rx) = unbounded();
    let options = ConsumerOptions::new(name)
        .sequential(sequential)
        .position(InitPosition::Head);
    assert!(queue.add_consumer(options, recorder(tx)).unwrap());
    rx
}

#[test]
fn test_three_messages_in_push_order() {
    let temp_dir = TempDir::new().unwrap();
    let registry = registry();
    let queue = registry
        .create(FileQueueBuilder::new(temp_dir.path(), "abc"))
        .unwrap();

    for payload in ["a", "bb", "ccc"] {
        queue.push(payload.as_bytes()).unwrap();
    }
    let rx = add_head_consumer(&queue, "reader", true);

    let messages: Vec<Message> = (0..3).map(|_| rx.recv_timeout(TIMEOUT).unwrap()).collect();
    let payloads: Vec<&[u8]> = messages.iter().map(Message::payload).collect();
    assert_eq!(payloads, vec![&b"a"[..], b"bb", b"ccc"]);
    assert_eq!(
        messages.iter().map(Message::len).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(messages.iter().all(Message::is_correct));
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_sequential_delivers_push_order_exactly_once() {
    let temp_dir = TempDir::new().unwrap();
    let registry = registry();
    let queue = registry
        .create(FileQueueBuilder::new(temp_dir.path(), "ordered").max_file_size(4096))
        .unwrap();

    let rx = add_head_consumer(&queue, "seq", true);
    let expected: Vec<Vec<u8>> = (0..500).map(|i| format!("message-{i:04}").into_bytes()).collect();
    for payload in &expected {
        queue.push_checked(payload).unwrap();
    }

    assert_eq!(recv_payloads(&rx, expected.len()), expected);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert!(queue.cur_file_no() > 0);
}

#[test]
fn test_concurrent_consumers_each_receive_everything() {
    let temp_dir = TempDir::new().unwrap();
    let registry = registry();
    let queue = registry
        .create(FileQueueBuilder::new(temp_dir.path(), "fanout"))
        .unwrap();

    let first = add_head_consumer(&queue, "first", false);
    let second = add_head_consumer(&queue, "second", false);
    for i in 0..100 {
        queue.push(format!("{i}").as_bytes()).unwrap();
    }

    for rx in [&first, &second] {
        let mut got = recv_payloads(rx, 100);
        got.sort();
        let mut expected: Vec<Vec<u8>> = (0..100).map(|i| format!("{i}").into_bytes()).collect();
        expected.sort();
        assert_eq!(got, expected);
    }
}

#[test]
fn test_failed_message_is_redelivered_before_next() {
    let temp_dir = TempDir::new().unwrap();
    let registry = registry();
    let queue = registry
        .create(FileQueueBuilder::new(temp_dir.path(), "retry").retry_policy(fast_retry()))
        .unwrap();

    let (tx, rx) = unbounded();
    let failed_once = Arc::new(AtomicBool::new(false));
    let handler = move |msg: &Message, _: &Confirmer| {
        tx.send(msg.payload().to_vec()).unwrap();
        msg.payload() != b"x" || failed_once.swap(true, Ordering::SeqCst)
    };
    queue
        .add_consumer(
            ConsumerOptions::new("seq")
                .sequential(true)
                .position(InitPosition::Head),
            handler,
        )
        .unwrap();

    queue.push(b"x").unwrap();
    queue.push(b"y").unwrap();

    assert_eq!(recv_payloads_raw(&rx, 3), vec![
        b"x".to_vec(),
        b"x".to_vec(),
        b"y".to_vec()
    ]);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

fn recv_payloads_raw(rx: &Receiver<Vec<u8>>, n: usize) -> Vec<Vec<u8>> {
    (0..n).map(|_| rx.recv_timeout(TIMEOUT).unwrap()).collect()
}

#[test]
fn test_slow_consumer_pins_oldest_segment() {
    let temp_dir = TempDir::new().unwrap();
    let registry = registry();
    let queue = registry
        .create(
            FileQueueBuilder::new(temp_dir.path(), "retain")
                .max_file_size(4096)
                .max_file_num(2),
        )
        .unwrap();

    let (gate_tx, gate_rx) = unbounded::<()>();
    let (seen_tx, seen_rx) = unbounded();
    let handler = move |msg: &Message, _: &Confirmer| {
        let _ = seen_tx.send(msg.payload()[0]);
        gate_rx.recv_timeout(TIMEOUT).is_ok()
    };
    queue
        .add_consumer(
            ConsumerOptions::new("slow")
                .sequential(true)
                .position(InitPosition::Head),
            handler,
        )
        .unwrap();

    // two 2 KiB frames fill a 4 KiB segment
    for i in 0..6u8 {
        queue.push(&[i; 2048]).unwrap();
    }
    assert_eq!(queue.cur_file_no(), 3);
    assert_eq!(seen_rx.recv_timeout(TIMEOUT).unwrap(), 0);
    let path = |no| segment_path(temp_dir.path(), "retain", no);
    assert!(path(0).exists(), "segment 0 is still referenced");
    assert_eq!(queue.min_file_no(), 0);

    for expected in 0..6u8 {
        gate_tx.send(()).unwrap();
        if expected < 5 {
            assert_eq!(seen_rx.recv_timeout(TIMEOUT).unwrap(), expected + 1);
        }
    }

    // next rotation collects what the consumer has left behind
    queue.push(&[6; 2048]).unwrap();
    queue.push(&[7; 2048]).unwrap();
    assert_eq!(queue.cur_file_no(), 4);
    assert!(!path(0).exists());
    assert!(!path(1).exists());
    assert!(queue.min_file_no() >= 2);
    drop(gate_tx);
}

#[test]
fn test_corrupted_payload_delivered_as_incorrect() {
    let temp_dir = TempDir::new().unwrap();
    let registry = registry();
    let queue = registry
        .create(FileQueueBuilder::new(temp_dir.path(), "corrupt"))
        .unwrap();

    queue.push_checked(b"hello").unwrap();
    queue.push_checked(b"world").unwrap();
    // header(10) + length word(4) + hash(4) puts the first payload at 18
    corrupt_byte(&segment_path(temp_dir.path(), "corrupt", 0), 18);

    let rx = add_head_consumer(&queue, "verify", true);
    let first = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(first.len(), 5);
    assert!(!first.is_correct());
    let second = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(second.payload(), b"world");
    assert!(second.is_correct());
}

#[test]
fn test_crc32_queue_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let registry = registry();
    let queue = registry
        .create(FileQueueBuilder::new(temp_dir.path(), "crc").hash_algorithm(HashAlgorithm::Crc32))
        .unwrap();

    let payload = vec![0x5a; 64 * 1024];
    queue.push_checked(&payload).unwrap();
    let rx = add_head_consumer(&queue, "c", false);
    let msg = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(msg.payload(), payload.as_slice());
    assert!(msg.is_correct());
}

#[test]
fn test_restart_resumes_after_clean_close() {
    let temp_dir = TempDir::new().unwrap();
    {
        let registry = registry();
        let queue = registry
            .create(FileQueueBuilder::new(temp_dir.path(), "durable"))
            .unwrap();
        let rx = add_head_consumer(&queue, "c", false);
        for i in 0..10 {
            queue.push(format!("old-{i}").as_bytes()).unwrap();
        }
        assert_eq!(recv_payloads(&rx, 10).len(), 10);
        registry.stop();
    }

    let registry = registry();
    let queue = registry
        .create(FileQueueBuilder::new(temp_dir.path(), "durable"))
        .unwrap();
    assert_eq!(queue.cur_file_no(), 1);
    queue.push(b"new").unwrap();

    let (tx, rx) = unbounded();
    queue
        .add_consumer(ConsumerOptions::new("c"), recorder(tx))
        .unwrap();
    assert_eq!(recv_payloads(&rx, 1), vec![b"new".to_vec()]);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_registry_lifecycle() {
    let temp_dir = TempDir::new().unwrap();
    let registry = registry();
    let queue = registry
        .create(FileQueueBuilder::new(temp_dir.path(), "life"))
        .unwrap();
    assert!(matches!(
        registry.create(FileQueueBuilder::new(temp_dir.path(), "life")),
        Err(QueueError::QueueExists { .. })
    ));
    assert!(registry.get("life").is_some());

    assert!(registry.remove("life").unwrap());
    assert!(registry.get("life").is_none());
    assert!(matches!(queue.push(b"late"), Err(QueueError::Closed { .. })));

    registry.stop();
    assert!(!registry.dispatcher().is_running());
}

fn corrupt_byte(path: &Path, offset: u64) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(b"X").unwrap();
    file.sync_all().unwrap();
}
