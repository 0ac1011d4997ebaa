#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{
    collections::HashSet,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use mailflow_common::{AttributeValue, Content, Mail, MailAddress, MailId};
use mailflow_queue::{
    BackingStore, FileBackingStore, Lease, MailQueue, MemoryBackingStore, QueueError, RecordKey,
};
use pretty_assertions::assert_eq;

fn addr(s: &str) -> MailAddress {
    s.parse().unwrap()
}

fn test_mail() -> Mail {
    let mut mail = Mail::new(
        Some(addr("sender@example.org")),
        [addr("a@x.com"), addr("b@y.com")],
        Content::from("Subject: durable\r\n\r\nbinary \x00\x01 body\r\n"),
    )
    .with_remote("mx.example.org", Some("192.0.2.1".parse().unwrap()));
    mail.set_attribute("score", AttributeValue::Integer(7));
    mail
}

fn file_store(path: &Path) -> Arc<dyn BackingStore> {
    let store = FileBackingStore::builder()
        .path(path.to_path_buf())
        .sync(false)
        .build()
        .unwrap();
    store.init().unwrap();
    Arc::new(store)
}

async fn dequeue_within(queue: &MailQueue, wait: Duration) -> Option<Lease> {
    tokio::time::timeout(wait, queue.dequeue())
        .await
        .ok()
        .map(|r| r.expect("dequeue failed"))
}

#[tokio::test]
async fn test_enqueue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mail = test_mail();

    {
        let queue = MailQueue::open(file_store(dir.path())).await.unwrap();
        queue.enqueue(&mail, Duration::ZERO).await.unwrap();
        // Simulated crash: the queue goes away without anything being acknowledged
    }

    let queue = MailQueue::open(file_store(dir.path())).await.unwrap();
    assert_eq!(queue.size(), 1);

    let lease = queue.dequeue().await.unwrap();
    let restored = lease.mail();
    assert_eq!(restored.id(), mail.id());
    assert_eq!(restored.sender(), mail.sender());
    assert_eq!(restored.recipients(), mail.recipients());
    assert_eq!(restored.content().as_bytes(), mail.content().as_bytes());
    assert_eq!(restored.attributes(), mail.attributes());
    assert_eq!(restored.remote_host(), Some("mx.example.org"));
}

#[tokio::test]
async fn test_unacknowledged_lease_is_redelivered_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mail = test_mail();

    {
        let queue = MailQueue::open(file_store(dir.path())).await.unwrap();
        queue.enqueue(&mail, Duration::ZERO).await.unwrap();
        let lease = queue.dequeue().await.unwrap();
        assert_eq!(lease.mail().id(), mail.id());
        std::mem::forget(lease);
    }

    let queue = MailQueue::open(file_store(dir.path())).await.unwrap();
    let lease = queue.dequeue().await.unwrap();
    assert_eq!(lease.mail().id(), mail.id());
}

#[tokio::test]
async fn test_done_true_removes_records() {
    let dir = tempfile::tempdir().unwrap();
    let queue = MailQueue::open(file_store(dir.path())).await.unwrap();
    queue.enqueue(&test_mail(), Duration::ZERO).await.unwrap();

    let lease = queue.dequeue().await.unwrap();
    lease.done(true).await.unwrap();

    assert_eq!(queue.size(), 0);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

    let reopened = MailQueue::open(file_store(dir.path())).await.unwrap();
    assert_eq!(reopened.size(), 0);
}

#[tokio::test]
async fn test_rollback_makes_mail_visible_at_head() {
    let queue = MailQueue::open(Arc::new(MemoryBackingStore::new()))
        .await
        .unwrap();
    let first = test_mail();
    let second = test_mail();
    queue.enqueue(&first, Duration::ZERO).await.unwrap();
    queue.enqueue(&second, Duration::ZERO).await.unwrap();

    let lease = queue.dequeue().await.unwrap();
    assert_eq!(lease.mail().id(), first.id());
    lease.done(false).await.unwrap();

    let again = queue.dequeue().await.unwrap();
    assert_eq!(again.mail().id(), first.id());
    again.done(true).await.unwrap();

    let next = queue.dequeue().await.unwrap();
    assert_eq!(next.mail().id(), second.id());
    next.done(true).await.unwrap();

    assert!(
        dequeue_within(&queue, Duration::from_millis(50))
            .await
            .is_none()
    );
    assert_eq!(queue.size(), 0);
}

#[tokio::test]
async fn test_delay_is_honored() {
    let queue = MailQueue::open(Arc::new(MemoryBackingStore::new()))
        .await
        .unwrap();
    let mail = test_mail();
    let delay = Duration::from_millis(300);

    let start = Instant::now();
    queue.enqueue(&mail, delay).await.unwrap();
    assert_eq!(queue.size(), 1);

    assert!(
        dequeue_within(&queue, Duration::from_millis(100))
            .await
            .is_none()
    );

    let lease = dequeue_within(&queue, Duration::from_secs(5))
        .await
        .expect("delayed mail never became visible");
    assert_eq!(lease.mail().id(), mail.id());
    // Schedule times are kept to the millisecond
    assert!(start.elapsed() + Duration::from_millis(1) >= delay);
}

#[tokio::test]
async fn test_delayed_mail_does_not_block_ready_mail() {
    let queue = MailQueue::open(Arc::new(MemoryBackingStore::new()))
        .await
        .unwrap();
    let delayed = test_mail();
    let ready = test_mail();

    queue.enqueue(&delayed, Duration::from_secs(3600)).await.unwrap();
    queue.enqueue(&ready, Duration::ZERO).await.unwrap();

    let lease = queue.dequeue().await.unwrap();
    assert_eq!(lease.mail().id(), ready.id());
}

#[tokio::test]
async fn test_flush_makes_delayed_mail_visible() {
    let queue = MailQueue::open(Arc::new(MemoryBackingStore::new()))
        .await
        .unwrap();
    let mail = test_mail();
    queue.enqueue(&mail, Duration::from_secs(3600)).await.unwrap();

    let waiter = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.dequeue().await })
    };
    tokio::task::yield_now().await;

    assert_eq!(queue.flush(), 1);
    let lease = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("flush did not wake the consumer")
        .unwrap()
        .unwrap();
    assert_eq!(lease.mail().id(), mail.id());

    // Nothing left to flush
    assert_eq!(queue.flush(), 0);
}

#[tokio::test]
async fn test_delayed_schedule_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let queue = MailQueue::open(file_store(dir.path())).await.unwrap();
        queue
            .enqueue(&test_mail(), Duration::from_secs(3600))
            .await
            .unwrap();
    }

    let queue = MailQueue::open(file_store(dir.path())).await.unwrap();
    assert_eq!(queue.size(), 1);
    assert!(
        dequeue_within(&queue, Duration::from_millis(50))
            .await
            .is_none()
    );

    assert_eq!(queue.flush(), 1);
    assert!(
        dequeue_within(&queue, Duration::from_millis(500))
            .await
            .is_some()
    );
}

#[tokio::test]
async fn test_unbounded_delay_stays_delayed() {
    let dir = tempfile::tempdir().unwrap();
    let mail = test_mail();

    {
        let queue = MailQueue::open(file_store(dir.path())).await.unwrap();
        queue.enqueue(&mail, Duration::MAX).await.unwrap();
        assert_eq!(queue.size(), 1);
        assert!(
            dequeue_within(&queue, Duration::from_millis(50))
                .await
                .is_none()
        );
    }

    let queue = MailQueue::open(file_store(dir.path())).await.unwrap();
    assert_eq!(queue.size(), 1);
    assert!(
        dequeue_within(&queue, Duration::from_millis(50))
            .await
            .is_none()
    );

    assert_eq!(queue.flush(), 1);
    let lease = dequeue_within(&queue, Duration::from_millis(500))
        .await
        .expect("flushed mail was not handed out");
    assert_eq!(lease.mail().id(), mail.id());
}

#[tokio::test]
async fn test_incomplete_pair_is_ignored_on_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let orphan = RecordKey::new(MailId::generate(), 0);
    std::fs::write(
        dir.path().join(format!("{}.eml", orphan.stem())),
        b"Subject: lost\r\n\r\n",
    )
    .unwrap();
    std::fs::write(dir.path().join(".tmp_partial.bin"), b"junk").unwrap();

    let queue = MailQueue::open(file_store(dir.path())).await.unwrap();
    assert_eq!(queue.size(), 0);
    assert!(
        dequeue_within(&queue, Duration::from_millis(50))
            .await
            .is_none()
    );
}

#[tokio::test]
async fn test_corrupt_record_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let good = test_mail();
    let bad = RecordKey::new(MailId::generate(), 0);
    std::fs::write(dir.path().join(format!("{}.eml", bad.stem())), b"body").unwrap();
    std::fs::write(dir.path().join(format!("{}.bin", bad.stem())), [0xff; 4]).unwrap();

    let queue = MailQueue::open(file_store(dir.path())).await.unwrap();
    queue.enqueue(&good, Duration::ZERO).await.unwrap();
    assert_eq!(queue.size(), 2);

    let lease = queue.dequeue().await.unwrap();
    assert_eq!(lease.mail().id(), good.id());
    assert_eq!(queue.size(), 1);

    // The broken pair is set aside instead of coming back on every restart
    assert!(dir.path().join(format!("{}.bin.corrupt", bad.stem())).exists());
    assert!(dir.path().join(format!("{}.eml.corrupt", bad.stem())).exists());
    assert!(!dir.path().join(format!("{}.bin", bad.stem())).exists());

    drop(lease);
    drop(queue);
    let queue = MailQueue::open(file_store(dir.path())).await.unwrap();
    assert_eq!(queue.size(), 1);
    assert_eq!(queue.dequeue().await.unwrap().mail().id(), good.id());
}

#[tokio::test]
async fn test_memory_store_shared_across_queue_instances() {
    let store = MemoryBackingStore::new();
    let mail = test_mail();

    let first = MailQueue::open(Arc::new(store.clone())).await.unwrap();
    first.enqueue(&mail, Duration::ZERO).await.unwrap();
    first.close();

    let second = MailQueue::open(Arc::new(store)).await.unwrap();
    let lease = second.dequeue().await.unwrap();
    assert_eq!(lease.mail().id(), mail.id());
    assert_eq!(lease.mail().content().as_bytes(), mail.content().as_bytes());
}

#[tokio::test]
async fn test_second_lease_for_different_key_while_first_outstanding() {
    let queue = MailQueue::open(Arc::new(MemoryBackingStore::new()))
        .await
        .unwrap();
    queue.enqueue(&test_mail(), Duration::ZERO).await.unwrap();
    queue.enqueue(&test_mail(), Duration::ZERO).await.unwrap();

    let first = queue.dequeue().await.unwrap();
    let second = queue.dequeue().await.unwrap();
    assert_ne!(first.mail().id(), second.mail().id());

    assert!(
        dequeue_within(&queue, Duration::from_millis(50))
            .await
            .is_none()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_consumers_never_share_a_lease() {
    const MAILS: usize = 64;

    let queue = MailQueue::open(Arc::new(MemoryBackingStore::new()))
        .await
        .unwrap();

    let consumers: Vec<_> = (0..8)
        .map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                loop {
                    match queue.dequeue().await {
                        Ok(lease) => {
                            seen.push(lease.mail().id());
                            tokio::task::yield_now().await;
                            lease.done(true).await.unwrap();
                        }
                        Err(QueueError::Closed) => return seen,
                        Err(e) => panic!("unexpected dequeue error: {e}"),
                    }
                }
            })
        })
        .collect();

    let mut expected = HashSet::new();
    for _ in 0..MAILS {
        let mail = test_mail();
        expected.insert(mail.id());
        queue.enqueue(&mail, Duration::ZERO).await.unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while queue.size() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    queue.close();

    let mut all = Vec::new();
    for consumer in consumers {
        all.extend(consumer.await.unwrap());
    }

    assert_eq!(all.len(), MAILS, "every mail leased exactly once");
    assert_eq!(all.into_iter().collect::<HashSet<_>>(), expected);
}
