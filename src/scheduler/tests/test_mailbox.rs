use crate::scheduler::{Delivery, Mailbox, MailboxState, PoolConfig, PoolError, WorkerPool};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc, Arc,
    },
    time::{Duration, Instant},
};

fn pool(max_threads: usize, queue_max_size: usize) -> WorkerPool {
    WorkerPool::new(PoolConfig {
        initial_threads: 1,
        max_threads,
        queue_max_size,
        keepalive: Duration::from_secs(5),
    })
    .unwrap()
}

fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !done() {
        assert!(Instant::now() < deadline, "timed out");
        std::thread::sleep(Duration::from_millis(2));
    }
}

struct Probe {
    mailbox: Arc<Mailbox<(usize, usize)>>,
    active: AtomicBool,
    overlaps: AtomicUsize,
    seen: Mutex<Vec<(usize, usize)>>,
}

#[test]
fn test_serialized_in_order_across_sessions() {
    const SESSIONS: usize = 100;
    const PRODUCERS: usize = 4;
    const EVENTS: usize = 10_000;

    let pool = Arc::new(pool(8, 1000));
    let probes: Arc<Vec<Arc<Probe>>> = Arc::new(
        (0..SESSIONS)
            .map(|_| {
                Arc::new(Probe {
                    mailbox: Arc::new(Mailbox::new()),
                    active: AtomicBool::new(false),
                    overlaps: AtomicUsize::new(0),
                    seen: Mutex::new(Vec::new()),
                })
            })
            .collect(),
    );

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let pool = pool.clone();
            let probes = probes.clone();
            std::thread::spawn(move || {
                for seq in 0..EVENTS / PRODUCERS {
                    let probe = probes[(seq * 7 + producer) % SESSIONS].clone();
                    let handler_probe = probe.clone();
                    probe
                        .mailbox
                        .enqueue(&pool, (producer, seq), move |event| {
                            if handler_probe.active.swap(true, Ordering::AcqRel) {
                                handler_probe.overlaps.fetch_add(1, Ordering::AcqRel);
                            }
                            handler_probe.seen.lock().push(event);
                            std::thread::yield_now();
                            handler_probe.active.store(false, Ordering::Release);
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    wait_until(|| {
        probes
            .iter()
            .map(|p| p.mailbox.processed() as usize)
            .sum::<usize>()
            == EVENTS
    });

    for probe in probes.iter() {
        assert_eq!(probe.overlaps.load(Ordering::Acquire), 0);
        assert_eq!(probe.mailbox.state(), MailboxState::Empty);
        let seen = probe.seen.lock();
        for producer in 0..PRODUCERS {
            let order: Vec<usize> = seen
                .iter()
                .filter(|(p, _)| *p == producer)
                .map(|(_, seq)| *seq)
                .collect();
            assert!(order.windows(2).all(|w| w[0] < w[1]));
        }
    }
}

#[test]
fn test_only_idle_mailbox_submits() {
    let pool = pool(1, 4);
    let mailbox: Arc<Mailbox<u32>> = Arc::new(Mailbox::new());
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Arc::new(Mutex::new(release_rx));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let handler = {
        let seen = seen.clone();
        let release_rx = release_rx.clone();
        move |event: u32| {
            release_rx.lock().recv().ok();
            seen.lock().push(event);
        }
    };
    assert_eq!(
        mailbox.enqueue(&pool, 1, handler.clone()).unwrap(),
        Delivery::Submitted
    );
    assert_eq!(mailbox.enqueue(&pool, 2, handler.clone()).unwrap(), Delivery::Queued);
    assert_eq!(mailbox.enqueue(&pool, 3, handler).unwrap(), Delivery::Queued);
    assert!(pool.outstanding() <= 1);

    for _ in 0..3 {
        release_tx.send(()).unwrap();
    }
    wait_until(|| mailbox.processed() == 3);
    assert_eq!(*seen.lock(), vec![1, 2, 3]);
    wait_until(|| mailbox.state() == MailboxState::Empty);
}

#[test]
fn test_rejected_events_are_returned() {
    let pool = pool(1, 1);
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    pool.submit(move || {
        started_tx.send(()).unwrap();
        release_rx.recv().ok();
    })
    .unwrap();
    started_rx.recv().unwrap();
    pool.submit(|| {}).unwrap();

    let mailbox: Arc<Mailbox<&'static str>> = Arc::new(Mailbox::new());
    let rejected = mailbox.enqueue(&pool, "invite", |_| {}).unwrap_err();
    assert_eq!(rejected.error, PoolError::Saturated { capacity: 2 });
    assert_eq!(rejected.events, vec!["invite"]);
    assert_eq!(mailbox.state(), MailboxState::Empty);
    assert_eq!(mailbox.pending(), 0);

    release_tx.send(()).unwrap();
    wait_until(|| pool.outstanding() == 0);
    let (tx, rx) = mpsc::channel();
    assert_eq!(
        mailbox
            .enqueue(&pool, "retry", move |e| tx.send(e).unwrap())
            .unwrap(),
        Delivery::Submitted
    );
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "retry");
}
