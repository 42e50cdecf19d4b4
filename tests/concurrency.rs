//! Concurrent publishers and subscribers on a shared channel.
//!
//! Each test runs against both storage connections.

use repubsub::{
    Exchange, FileConnection, FileConnectionConfig, MemoryConnection, Message, Predicate,
    Sequence, StorageConnection, Subscription, TopicShape,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const PUBLISHERS: usize = 4;
const PER_PUBLISHER: usize = 250;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn connections(dir: &TempDir) -> Vec<(&'static str, Arc<dyn StorageConnection>)> {
    let file = FileConnection::open_or_create(FileConnectionConfig {
        path: dir.path().join("broker"),
        sync_interval: 1000,
        ..Default::default()
    })
    .unwrap();
    let memory: Arc<dyn StorageConnection> = Arc::new(MemoryConnection::new());
    let file: Arc<dyn StorageConnection> = Arc::new(file);
    vec![("memory", memory), ("file", file)]
}

fn collect(sub: &mut Subscription, count: usize) -> Vec<Message> {
    let mut out = Vec::with_capacity(count);
    while out.len() < count {
        match sub.next_message() {
            Some(item) => out.push(item.unwrap()),
            None => break,
        }
    }
    out
}

fn publish_concurrently(ex: &Exchange) {
    let handles: Vec<_> = (0..PUBLISHERS)
        .map(|p| {
            let ex = ex.clone();
            thread::spawn(move || {
                let topic = ex.topic(format!("publisher.p{}.msg", p)).unwrap();
                for i in 0..PER_PUBLISHER {
                    topic.publish(format!("{}", i)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_concurrent_publishers_unique_ordered_sequences() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    for (name, conn) in connections(&dir) {
        let ex = Exchange::open(conn, "regex_demo", TopicShape::Path).unwrap();
        let mut sub = ex.queue(Predicate::always()).unwrap().subscribe().unwrap();

        publish_concurrently(&ex);

        let total = PUBLISHERS * PER_PUBLISHER;
        let received = collect(&mut sub, total);
        assert_eq!(received.len(), total, "{}", name);

        let sequences: Vec<u64> = received.iter().map(|m| m.sequence.0).collect();
        let expected: Vec<u64> = (1..=total as u64).collect();
        assert_eq!(sequences, expected, "{}: gap, duplicate or reorder", name);

        // Each publisher's own messages arrive in the order it sent them.
        let mut per_publisher: HashMap<String, Vec<usize>> = HashMap::new();
        for message in &received {
            per_publisher
                .entry(message.topic.to_string())
                .or_default()
                .push(message.payload.parse().unwrap());
        }
        assert_eq!(per_publisher.len(), PUBLISHERS);
        for payloads in per_publisher.values() {
            assert_eq!(*payloads, (0..PER_PUBLISHER).collect::<Vec<_>>(), "{}", name);
        }

        assert!(sub.next_timeout(Duration::from_millis(20)).is_none());
        assert_eq!(ex.log().tail().unwrap(), Sequence(total as u64));
    }
}

#[test]
fn test_subscribers_are_independent() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    for (name, conn) in connections(&dir) {
        let ex = Exchange::open(conn, "regex_demo", TopicShape::Path).unwrap();

        let consumers: Vec<_> = (0..PUBLISHERS)
            .map(|p| {
                let pattern = format!(r"^publisher\.p{}\.", p);
                let mut sub = ex
                    .queue(Predicate::pattern(&pattern).unwrap())
                    .unwrap()
                    .subscribe()
                    .unwrap();
                thread::spawn(move || collect(&mut sub, PER_PUBLISHER))
            })
            .collect();

        // A subscriber that never reads must not hold anyone back.
        let _idle = ex.queue(Predicate::always()).unwrap().subscribe().unwrap();

        publish_concurrently(&ex);

        for consumer in consumers {
            let received = consumer.join().unwrap();
            assert_eq!(received.len(), PER_PUBLISHER, "{}", name);
            assert!(received
                .windows(2)
                .all(|pair| pair[0].sequence < pair[1].sequence));
        }
    }
}

#[test]
fn test_subscribe_while_publishing_has_no_gaps() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    for (name, conn) in connections(&dir) {
        let ex = Exchange::open(conn, "regex_demo", TopicShape::Path).unwrap();

        let publisher = {
            let ex = ex.clone();
            thread::spawn(move || {
                let topic = ex.topic("a.b").unwrap();
                for i in 0..1000 {
                    topic.publish(i.to_string()).unwrap();
                }
            })
        };

        // Joins mid-stream, replaying from the start: the disk/memory
        // backlog and the live feed must stitch together exactly.
        thread::sleep(Duration::from_millis(1));
        let mut sub = ex
            .queue_from(Predicate::always(), Sequence(1))
            .unwrap()
            .subscribe()
            .unwrap();

        publisher.join().unwrap();

        let received = collect(&mut sub, 1000);
        let sequences: Vec<u64> = received.iter().map(|m| m.sequence.0).collect();
        assert_eq!(sequences, (1..=1000).collect::<Vec<_>>(), "{}", name);
    }
}

#[test]
fn test_publish_racing_disconnect_is_delivered_or_rejected() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let memory = Arc::new(MemoryConnection::new());
    let file = Arc::new(
        FileConnection::open_or_create(FileConnectionConfig {
            path: dir.path().join("broker"),
            sync_interval: 1000,
            ..Default::default()
        })
        .unwrap(),
    );
    let memory_conn: Arc<dyn StorageConnection> = memory.clone();
    let file_conn: Arc<dyn StorageConnection> = file.clone();
    let disconnect_memory: Box<dyn Fn()> = Box::new(move || memory.disconnect());
    let disconnect_file: Box<dyn Fn()> = Box::new(move || file.disconnect());
    let cases = vec![
        ("memory", memory_conn, disconnect_memory),
        ("file", file_conn, disconnect_file),
    ];

    for (name, conn, disconnect) in cases {
        let ex = Exchange::open(conn, "regex_demo", TopicShape::Path).unwrap();
        let mut sub = ex.queue(Predicate::always()).unwrap().subscribe().unwrap();

        let publishers: Vec<_> = (0..PUBLISHERS)
            .map(|p| {
                let ex = ex.clone();
                thread::spawn(move || {
                    let topic = ex.topic(format!("publisher.p{}.msg", p)).unwrap();
                    let mut accepted = Vec::new();
                    for i in 0..PER_PUBLISHER {
                        match topic.publish(i.to_string()) {
                            Ok(sequence) => accepted.push(sequence),
                            Err(e) => {
                                assert!(e.is_connection_lost());
                                break;
                            }
                        }
                    }
                    accepted
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(2));
        disconnect();

        let mut accepted: Vec<Sequence> = publishers
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        accepted.sort();

        // Everything acknowledged arrives before the connection error.
        let mut delivered = Vec::new();
        let mut lost = false;
        while let Some(item) = sub.next_message() {
            match item {
                Ok(message) => delivered.push(message.sequence),
                Err(e) => {
                    assert!(e.is_connection_lost(), "{}", name);
                    lost = true;
                }
            }
        }
        assert!(lost, "{}", name);
        assert_eq!(delivered, accepted, "{}", name);
    }
}
