//! End-to-end tests: producer to embedded broker to consumer stream.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};

use logbridge::broker::InMemoryBroker;
use logbridge::config::{ClientConfig, ConsumerConfig, ProducerConfig};
use logbridge::consumer::Consumer;
use logbridge::message::Message;
use logbridge::producer::Producer;
use logbridge::stream::EventStream;

fn client() -> ClientConfig {
    ClientConfig {
        buffering_interval: Duration::from_millis(10),
        keepalive: false,
        ..Default::default()
    }
}

fn producer_config() -> ProducerConfig {
    ProducerConfig {
        client: client(),
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

fn consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        client: client(),
        poll_interval: Duration::from_millis(10),
        group_heartbeat_interval: Duration::from_millis(50),
        session_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

/// Collect `count` records from `stream`, failing the test after `within`.
async fn take(stream: &mut EventStream<Message>, count: usize, within: Duration) -> Vec<Message> {
    let mut records = Vec::with_capacity(count);
    tokio::time::timeout(within, async {
        while records.len() < count {
            match stream.next().await {
                Some(Ok(record)) => records.push(record),
                Some(Err(e)) => panic!("stream error: {}", e),
                None => break,
            }
        }
    })
    .await
    .expect("timed out waiting for records");
    records
}

// ============================================================================
// Scenario A
// ============================================================================

#[tokio::test]
async fn test_contribution_round_trip() {
    let broker = Arc::new(InMemoryBroker::new());

    let producer = Producer::with_cluster(producer_config(), broker.clone())
        .await
        .unwrap();
    producer
        .produce(
            "contributions",
            Some("tx1"),
            &json!({"txHash": "tx1", "amount": 5}),
        )
        .unwrap();
    producer.flush(Duration::from_secs(2)).await.unwrap();

    let consumer = Consumer::with_cluster(consumer_config(), "contributions", "worker-1", broker)
        .await
        .unwrap();
    assert_eq!(consumer.group_id(), "contribution-group");

    let mut stream = consumer.listen("contributions", |_| false).await;
    let records = take(&mut stream, 1, Duration::from_secs(5)).await;

    assert_eq!(records[0].key_str(), Some("tx1"));
    let value: Value = records[0].json().unwrap();
    assert_eq!(value, json!({"txHash": "tx1", "amount": 5}));

    consumer.commit(&records[0]).await;
    consumer.close().await;
    producer.close().await.unwrap();
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn test_same_key_preserves_send_order() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.create_topic("ledger", 3).await.unwrap();

    let producer = Producer::with_cluster(producer_config(), broker.clone())
        .await
        .unwrap();
    for seq in 0..50 {
        let key = if seq % 2 == 0 { "alice" } else { "bob" };
        producer
            .produce("ledger", Some(key), &json!({"key": key, "seq": seq}))
            .unwrap();
    }
    producer.flush(Duration::from_secs(2)).await.unwrap();

    let consumer = Consumer::with_cluster(consumer_config(), "ledger", "worker-1", broker)
        .await
        .unwrap();
    let mut stream = consumer.listen("ledger", |_| false).await;
    let records = take(&mut stream, 50, Duration::from_secs(5)).await;

    for key in ["alice", "bob"] {
        let seqs: Vec<i64> = records
            .iter()
            .filter(|r| r.key_str() == Some(key))
            .map(|r| r.json::<Value>().unwrap()["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs.len(), 25);
        let mut sorted = seqs.clone();
        sorted.sort();
        assert_eq!(seqs, sorted, "records for {} out of order", key);

        let partitions: std::collections::HashSet<_> = records
            .iter()
            .filter(|r| r.key_str() == Some(key))
            .map(|r| r.partition)
            .collect();
        assert_eq!(partitions.len(), 1);
    }
}

// ============================================================================
// Batch bound
// ============================================================================

#[tokio::test]
async fn test_poll_cycle_never_exceeds_batch_size() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.create_topic("bulk", 4).await.unwrap();

    let producer = Producer::with_cluster(producer_config(), broker.clone())
        .await
        .unwrap();
    for i in 0..350 {
        producer.produce("bulk", None, &json!({"i": i})).unwrap();
    }
    producer.flush(Duration::from_secs(2)).await.unwrap();

    let consumer = Consumer::with_cluster(consumer_config(), "bulk", "worker-1", broker)
        .await
        .unwrap();

    let mut total = 0;
    loop {
        let batch = consumer.poll_batch().await.unwrap();
        assert!(batch.len() <= 100, "batch of {}", batch.len());
        if batch.is_empty() {
            break;
        }
        total += batch.len();
    }
    assert_eq!(total, 350);
}

// ============================================================================
// Single listener
// ============================================================================

#[tokio::test]
async fn test_second_consumer_listener_replaces_first() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.create_topic("events", 2).await.unwrap();

    let consumer = Consumer::with_cluster(consumer_config(), "events", "worker-1", broker.clone())
        .await
        .unwrap();
    let generation = consumer.generation().await;

    let mut first = consumer.listen("events", |_| false).await;
    let mut second = consumer.listen("events", |_| false).await;

    // The replaced stream ends without delivering anything.
    let leftover = tokio::time::timeout(Duration::from_secs(2), first.next())
        .await
        .unwrap();
    assert!(leftover.is_none());

    // Resubscribing rejoined the group with a fresh assignment.
    assert!(consumer.generation().await > generation);
    assert_eq!(consumer.membership().await.partition_ids("events"), vec![0, 1]);

    let producer = Producer::with_cluster(producer_config(), broker)
        .await
        .unwrap();
    for i in 0..10 {
        producer.produce("events", None, &json!({"i": i})).unwrap();
    }
    producer.flush(Duration::from_secs(2)).await.unwrap();

    let records = take(&mut second, 10, Duration::from_secs(5)).await;
    let mut seen: Vec<i64> = records
        .iter()
        .map(|r| r.json::<Value>().unwrap()["i"].as_i64().unwrap())
        .collect();
    seen.sort();
    assert_eq!(seen, (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_listen_switches_topic() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.create_topic("old", 1).await.unwrap();
    broker.create_topic("new", 2).await.unwrap();

    let producer = Producer::with_cluster(producer_config(), broker.clone())
        .await
        .unwrap();
    producer.produce("new", None, &json!({"on": "new"})).unwrap();
    producer.flush(Duration::from_secs(2)).await.unwrap();

    let consumer = Consumer::with_cluster(consumer_config(), "old", "worker-1", broker)
        .await
        .unwrap();
    assert_eq!(consumer.membership().await.partition_ids("old"), vec![0]);

    let mut stream = consumer.listen("new", |_| false).await;
    assert_eq!(consumer.subscription().await, "new");
    let membership = consumer.membership().await;
    assert!(membership.partition_ids("old").is_empty());
    assert_eq!(membership.partition_ids("new"), vec![0, 1]);

    let records = take(&mut stream, 1, Duration::from_secs(5)).await;
    assert_eq!(records[0].topic, "new");
}

#[tokio::test]
async fn test_second_producer_listener_is_a_no_op() {
    let broker = Arc::new(InMemoryBroker::new());
    let producer = Producer::with_cluster(producer_config(), broker)
        .await
        .unwrap();

    let mut reports = producer.listen().expect("first listener");
    assert!(producer.listen().is_none());

    producer.produce("t", None, &json!({"n": 1})).unwrap();
    producer.flush(Duration::from_secs(2)).await.unwrap();

    let report = tokio::time::timeout(Duration::from_secs(2), reports.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.topic, "t");

    // Dropping the stream frees the slot.
    drop(reports);
    assert!(producer.listen().is_some());
}

// ============================================================================
// Finishing a stream
// ============================================================================

#[tokio::test]
async fn test_check_if_finished_completes_stream() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.create_topic("jobs", 1).await.unwrap();

    let producer = Producer::with_cluster(producer_config(), broker.clone())
        .await
        .unwrap();
    for i in 0..10 {
        producer.produce("jobs", None, &json!({"i": i})).unwrap();
    }
    producer.flush(Duration::from_secs(2)).await.unwrap();

    let consumer = Consumer::with_cluster(consumer_config(), "jobs", "worker-1", broker)
        .await
        .unwrap();
    let mut stream = consumer
        .listen("jobs", |record: &Message| {
            record.json::<Value>().map(|v| v["i"] == 3).unwrap_or(false)
        })
        .await;

    let records: Vec<_> = tokio::time::timeout(Duration::from_secs(5), async {
        let mut records = Vec::new();
        while let Some(item) = stream.next().await {
            records.push(item.unwrap());
        }
        records
    })
    .await
    .unwrap();

    assert_eq!(records.len(), 4);
    assert_eq!(records.last().unwrap().offset.value(), 3);

    // Undelivered records are picked up by the next poll.
    let rest = consumer.poll_batch().await.unwrap();
    assert_eq!(rest.first().map(|r| r.offset.value()), Some(4));
}

#[tokio::test]
async fn test_replaced_listener_drops_buffered_records() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.create_topic("events", 1).await.unwrap();

    let producer = Producer::with_cluster(producer_config(), broker.clone())
        .await
        .unwrap();
    for i in 0..5 {
        producer.produce("events", None, &json!({"i": i})).unwrap();
    }
    producer.flush(Duration::from_secs(2)).await.unwrap();

    let consumer = Consumer::with_cluster(consumer_config(), "events", "worker-1", broker)
        .await
        .unwrap();
    let mut first = consumer.listen("events", |_| false).await;
    // Let the poll loop fill the first stream without reading from it.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut second = consumer.listen("events", |_| false).await;

    let leftover = tokio::time::timeout(Duration::from_secs(2), first.next())
        .await
        .unwrap();
    assert!(leftover.is_none());

    let records = take(&mut second, 5, Duration::from_secs(5)).await;
    assert_eq!(
        records.iter().map(|r| r.offset.value()).collect::<Vec<_>>(),
        vec![0, 1, 2, 3, 4]
    );
}

// ============================================================================
// Closing with an unread stream
// ============================================================================

#[tokio::test]
async fn test_consumer_close_with_full_stream() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.create_topic("bulk", 1).await.unwrap();

    let producer = Producer::with_cluster(producer_config(), broker.clone())
        .await
        .unwrap();
    for i in 0..300 {
        producer.produce("bulk", None, &json!({"i": i})).unwrap();
    }
    producer.flush(Duration::from_secs(2)).await.unwrap();

    let config = ConsumerConfig {
        batch_size: 10,
        ..consumer_config()
    };
    let consumer = Consumer::with_cluster(config, "bulk", "worker-1", broker)
        .await
        .unwrap();
    let mut stream = consumer.listen("bulk", |_| false).await;
    take(&mut stream, 1, Duration::from_secs(5)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(5), consumer.close())
        .await
        .expect("close waited on a full stream");

    // Buffered records drain, then the stream ends with a connection error.
    let rest: Vec<_> = tokio::time::timeout(Duration::from_secs(2), stream.collect::<Vec<_>>())
        .await
        .unwrap();
    assert!(rest.len() <= 11);
    assert!(rest.last().unwrap().as_ref().unwrap_err().is_connection());
    assert!(rest[..rest.len() - 1].iter().all(|r| r.is_ok()));
}
