//! Work queue behavior across tasks
//!
//! Producers run on spawned tasks the way network callbacks do; consumers
//! wait on `dequeue` with a timeout.

use du_agent::clock::system_clock;
use du_agent::workqueue::{WorkQueue, WorkQueueError};
use std::collections::HashSet;
use std::time::Duration;

#[tokio::test]
async fn test_items_cross_tasks_in_order() {
    let queue = WorkQueue::new("update", 16, system_clock());
    let producer = queue.clone();

    tokio::spawn(async move {
        for i in 0..5 {
            producer.enqueue(format!("doc-{i}")).unwrap();
        }
    })
    .await
    .unwrap();

    for i in 0..5 {
        let item = queue.dequeue(Duration::from_millis(100)).await.unwrap();
        assert_eq!(item.payload, format!("doc-{i}"));
    }
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_consumer_wakes_when_item_arrives() {
    let queue = WorkQueue::new("reporting", 4, system_clock());
    let consumer = queue.clone();

    let waiting = tokio::spawn(async move { consumer.dequeue(Duration::from_secs(5)).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.enqueue("late").unwrap();

    let item = waiting.await.unwrap().unwrap();
    assert_eq!(item.payload, "late");
}

#[tokio::test]
async fn test_consumers_split_the_work() {
    let queue = WorkQueue::new("update", 32, system_clock());
    for i in 0..20 {
        queue.enqueue(i.to_string()).unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let consumer = queue.clone();
        handles.push(tokio::spawn(async move {
            let mut taken = Vec::new();
            while let Some(item) = consumer.dequeue(Duration::from_millis(50)).await {
                taken.push(item.payload);
            }
            taken
        }));
    }

    let results = futures::future::join_all(handles).await;
    let all: Vec<String> = results.into_iter().flat_map(|r| r.unwrap()).collect();
    let unique: HashSet<&String> = all.iter().collect();
    assert_eq!(all.len(), 20);
    assert_eq!(unique.len(), 20);
}

#[test]
fn test_full_queue_reports_its_limit() {
    let queue = WorkQueue::new("reporting", 2, system_clock());
    queue.enqueue("a").unwrap();
    queue.enqueue("b").unwrap();

    assert_eq!(
        queue.enqueue("c"),
        Err(WorkQueueError::Full {
            name: "reporting".to_string(),
            capacity: 2
        })
    );
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.try_dequeue().unwrap().payload, "a");
    queue.enqueue("c").unwrap();
}
