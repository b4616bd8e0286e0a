/// 并发测试模块
/// 测试多线程下的退休门闩、计数平衡与读写并发
use super::{Tracked, counter};
use crate::{KeyedStore, Link, MarkedPtr, NodePtr, ReclaimDomain, SnapshotMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

/// 测试1: N 个线程同时释放 N 个 pin，终止回调与释放回调各只触发一次
#[test]
fn test_concurrent_release_retires_exactly_once() {
    const THREADS: usize = 8;

    for _ in 0..200 {
        let terminated = counter();
        let freed = counter();
        let domain = {
            let terminated = terminated.clone();
            let freed = freed.clone();
            ReclaimDomain::builder()
                .on_terminate(move |_| {
                    terminated.fetch_add(1, Ordering::SeqCst);
                })
                .on_free(move |_: u64| {
                    freed.fetch_add(1, Ordering::SeqCst);
                })
                .build()
        };

        let node = domain.new_node(99u64);
        for _ in 1..THREADS {
            unsafe { domain.retain(node).unwrap() };
        }
        assert_eq!(unsafe { node.ref_count() }, THREADS);

        let winners = AtomicUsize::new(0);
        let barrier = Barrier::new(THREADS);
        thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    barrier.wait();
                    if unsafe { domain.release(node) }.is_none() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
        domain.sweep(true);
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }
}

/// 测试2: 读者不断 pin，写者不断替换，每个负载在被读到时都完好，且最终全部释放
#[test]
fn test_readers_and_writers_on_one_link() {
    const READERS: usize = 4;
    const WRITERS: usize = 2;
    const WRITES_PER_WRITER: usize = 2_000;

    let drops = counter();
    let domain = ReclaimDomain::<Tracked>::with_threshold(16);
    let link = Link::new();
    let done = AtomicUsize::new(0);

    {
        let first = domain.insert(Tracked::new(0, &drops));
        domain.store(&link, Some(&first));
    }

    thread::scope(|scope| {
        for _ in 0..READERS {
            scope.spawn(|| {
                let mut reads = 0usize;
                while done.load(Ordering::Acquire) < WRITERS || reads < 100 {
                    if let Some(pinned) = domain.pin(&link) {
                        assert!(pinned.value <= WRITERS * WRITES_PER_WRITER);
                        assert!(pinned.ref_count() >= 1);
                        reads += 1;
                    }
                }
            });
        }

        for writer in 0..WRITERS {
            let domain = &domain;
            let link = &link;
            let drops = &drops;
            let done = &done;
            scope.spawn(move || {
                for i in 0..WRITES_PER_WRITER {
                    let value = writer * WRITES_PER_WRITER + i + 1;
                    let node = domain.insert(Tracked::new(value, drops));
                    domain.store(link, Some(&node));
                }
                done.fetch_add(1, Ordering::Release);
            });
        }
    });

    domain.store(&link, None);
    drop(domain);
    assert_eq!(drops.load(Ordering::SeqCst), WRITERS * WRITES_PER_WRITER + 1);
}

/// 测试3: 基于 compare_and_swap 的无锁计数器，不丢失更新
#[test]
fn test_compare_and_swap_counter_loses_no_updates() {
    const THREADS: usize = 4;
    const INCREMENTS: usize = 500;

    let freed = counter();
    let domain = {
        let freed = freed.clone();
        ReclaimDomain::builder()
            .retirement_threshold(8)
            .on_free(move |_: usize| {
                freed.fetch_add(1, Ordering::SeqCst);
            })
            .build()
    };
    let link = Link::new();
    domain.store(&link, Some(&domain.insert(0usize)));

    thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                for _ in 0..INCREMENTS {
                    loop {
                        let current = domain.pin(&link).unwrap();
                        let next = domain.insert(*current + 1);
                        let expected = MarkedPtr::from(current.as_ptr());
                        if domain.compare_exchange(&link, expected, Some(&next)).is_ok() {
                            break;
                        }
                    }
                }
            });
        }
    });

    assert_eq!(*domain.pin(&link).unwrap(), THREADS * INCREMENTS);

    domain.store(&link, None);
    domain.sweep(true);
    // Every node ever created, winners and losers alike, was freed exactly once.
    assert_eq!(freed.load(Ordering::SeqCst), domain.retired_count());
    assert_eq!(domain.backlog(), 0);
    assert_eq!(domain.pending(), 0);
}

/// 测试4: 多个线程对同一节点的 retain/release 交错，计数最终回到初值
#[test]
fn test_interleaved_retain_release_balance() {
    const THREADS: usize = 6;
    const ROUNDS: usize = 5_000;

    let domain = ReclaimDomain::new();
    let link = Link::new();
    let node = domain.insert(String::from("shared"));
    domain.store(&link, Some(&node));

    thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                for _ in 0..ROUNDS {
                    let pinned: NodePtr<String> = domain.dereference_skipping_removed(&link).unwrap();
                    let extra = unsafe { domain.retain(pinned) }.unwrap();
                    unsafe {
                        assert_eq!(domain.release(extra), Some(pinned));
                        assert_eq!(domain.release(pinned), Some(pinned));
                    }
                }
            });
        }
    });

    assert_eq!(node.ref_count(), 2);
    assert_eq!(domain.retired_count(), 0);
    domain.store(&link, None);
}

/// 测试5: 写者通过 store_into 竞争同一链接，旧目标全部退休
#[test]
fn test_concurrent_store_into_retires_every_replaced_node() {
    const THREADS: usize = 4;
    const STORES: usize = 1_000;

    let drops = counter();
    let domain = ReclaimDomain::<Tracked>::with_threshold(32);
    let link = Link::new();

    thread::scope(|scope| {
        for t in 0..THREADS {
            let domain = &domain;
            let link = &link;
            let drops = &drops;
            scope.spawn(move || {
                for i in 0..STORES {
                    let node = domain.new_node(Tracked::new(t * STORES + i, drops));
                    unsafe {
                        domain.store_into(link, Some(node));
                        domain.release(node);
                    }
                }
            });
        }
    });

    assert_eq!(domain.retired_count(), THREADS * STORES - 1);
    domain.store(&link, None);
    drop(domain);
    assert_eq!(drops.load(Ordering::SeqCst), THREADS * STORES);
}

/// 测试6: SnapshotMap 并发读写
#[test]
fn test_snapshot_map_concurrent_readers_and_writer() {
    let map = Arc::new(SnapshotMap::builder().retirement_threshold(8).build());
    let stop = Arc::new(AtomicUsize::new(0));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let map = map.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                while stop.load(Ordering::Acquire) == 0 {
                    if let Some(value) = map.find(b"counter") {
                        let n = u32::from_le_bytes(value[..4].try_into().unwrap());
                        assert!(n < 1_000);
                    }
                    let mut previous: Option<Vec<u8>> = None;
                    map.walk_sorted(|key, _| {
                        if let Some(previous) = &previous {
                            assert!(previous.as_slice() < key);
                        }
                        previous = Some(key.to_vec());
                        crate::WalkAction::Continue
                    });
                }
            })
        })
        .collect();

    for n in 0u32..1_000 {
        map.add(b"counter", &n.to_le_bytes());
        map.add(&n.to_be_bytes(), b"x");
    }
    stop.store(1, Ordering::Release);
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(map.len(), 1_001);
    assert_eq!(&*map.find(b"counter").unwrap(), &999u32.to_le_bytes());
}

/// 测试7: 读者持续 pin 时，待释放节点数量保持有界
#[test]
fn test_pending_stays_bounded_under_continuous_readers() {
    const READERS: usize = 6;
    const STORES: usize = 50_000;

    let drops = counter();
    let domain = ReclaimDomain::<Tracked>::with_threshold(8);
    let link = Link::new();
    domain.store(&link, Some(&domain.insert(Tracked::new(0, &drops))));
    let stop = AtomicUsize::new(0);

    let max_pending = thread::scope(|scope| {
        for _ in 0..READERS {
            scope.spawn(|| {
                while stop.load(Ordering::Acquire) == 0 {
                    if let Some(pinned) = domain.pin(&link) {
                        assert!(pinned.value <= STORES);
                    }
                }
            });
        }

        let mut max_pending = 0;
        for i in 1..=STORES {
            domain.store(&link, Some(&domain.insert(Tracked::new(i, &drops))));
            if i % 64 == 0 {
                max_pending = max_pending.max(domain.pending());
            }
        }
        stop.store(1, Ordering::Release);
        max_pending
    });

    // Popped-but-unfreed nodes never outgrow one buffer's worth.
    assert!(
        max_pending <= 3 * domain.buffer_capacity(),
        "pending grew to {max_pending}"
    );

    domain.store(&link, None);
    drop(domain);
    assert_eq!(drops.load(Ordering::SeqCst), STORES + 1);
}
