use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use rustrabbit::rabbitmq::worker::{work_item, WorkerFailure};
use rustrabbit::rabbitmq::{
    ErrorSink, FullPolicy, LogErrorSink, MemoryBroker, RabbitMQError, Worker, WorkerConfig,
};
use tokio::sync::oneshot;

use crate::common::memory_factory;

#[derive(Default)]
struct CollectingSink {
    failures: Mutex<Vec<String>>,
}

impl ErrorSink for CollectingSink {
    fn report(&self, failure: WorkerFailure) {
        let text = match failure {
            WorkerFailure::Failed { error, .. } => error.to_string(),
            WorkerFailure::Panicked { message, .. } => format!("panic: {}", message),
        };
        self.failures.lock().unwrap().push(text);
    }
}

#[tokio::test]
async fn test_join_waits_only_for_earlier_tasks() {
    let broker = MemoryBroker::new();
    let worker = Worker::spawn(
        memory_factory(&broker).manager(),
        WorkerConfig::default(),
        Arc::new(LogErrorSink),
    );
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..10 {
        let done = done.clone();
        worker
            .submit(work_item(move |_| {
                async move {
                    tokio::task::yield_now().await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            }))
            .await
            .unwrap();
    }
    worker.join().await.unwrap();
    assert_eq!(done.load(Ordering::SeqCst), 10);

    // a task submitted after join does not hold up the next join on earlier work
    let (release_tx, release_rx) = oneshot::channel::<()>();
    worker
        .submit(work_item(move |_| {
            async move {
                let _ = release_rx.await;
                Ok(())
            }
            .boxed()
        }))
        .await
        .unwrap();
    assert_eq!(worker.pending(), 1);
    release_tx.send(()).unwrap();
    worker.join().await.unwrap();
    assert_eq!(worker.pending(), 0);
}

#[tokio::test]
async fn test_failed_and_panicking_tasks_are_supervised() {
    let broker = MemoryBroker::new();
    let sink = Arc::new(CollectingSink::default());
    let worker = Worker::spawn(memory_factory(&broker).manager(), WorkerConfig::default(), sink.clone());

    worker
        .submit(work_item(|_| {
            async { Err(RabbitMQError::PublishError("broker said no".into())) }.boxed()
        }))
        .await
        .unwrap();
    worker
        .submit(work_item(|_| async { panic!("bad task") }.boxed()))
        .await
        .unwrap();
    worker
        .submit(work_item(|manager| {
            async move {
                manager.get_connection().await?;
                Ok(())
            }
            .boxed()
        }))
        .await
        .unwrap();
    worker.join().await.unwrap();

    assert_eq!(
        *sink.failures.lock().unwrap(),
        vec![
            "RabbitMQ publish error: broker said no".to_string(),
            "panic: bad task".to_string(),
        ]
    );
    // the task after the panic still ran on the worker's connection
    assert_eq!(broker.connections_opened(), 1);
}

#[tokio::test]
async fn test_block_policy_waits_for_capacity() {
    let broker = MemoryBroker::new();
    let worker = Worker::spawn(
        memory_factory(&broker).manager(),
        WorkerConfig {
            capacity: 2,
            full_policy: FullPolicy::Block,
        },
        Arc::new(LogErrorSink),
    );
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..20 {
        let done = done.clone();
        worker
            .submit(work_item(move |_| {
                async move {
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            }))
            .await
            .unwrap();
    }
    worker.shutdown().await.unwrap();

    assert_eq!(done.load(Ordering::SeqCst), 20);
}
