/// 基础测试模块
/// 测试节点创建、链接协议与计数调整的正确性
use crate::{Link, MarkedPtr, ReclaimDomain};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 测试1: 新节点计数为 1，负载可读
#[test]
fn test_new_node_starts_with_one_pin() {
    let domain = ReclaimDomain::new();
    let node = domain.new_node(42u32);

    unsafe {
        assert_eq!(node.ref_count(), 1);
        assert_eq!(*node.payload(), 42);
        assert!(!node.is_retired());
        assert!(domain.release(node).is_none());
    }
}

/// 测试2: 空链接解引用返回 None
#[test]
fn test_dereference_null_link() {
    let domain = ReclaimDomain::<u32>::new();
    let link = Link::new();

    assert!(link.is_null());
    assert!(domain.dereference_skipping_removed(&link).is_none());
    assert!(domain.dereference_allowing_removed(&link).is_none());
    assert!(domain.pin(&link).is_none());
}

/// 测试3: retain / release 场景，终止与释放回调各触发一次
#[test]
fn test_retain_release_scenario() {
    let terminated = Arc::new(AtomicUsize::new(0));
    let freed = Arc::new(std::sync::Mutex::new(Vec::new()));

    let domain = {
        let terminated = terminated.clone();
        let freed = freed.clone();
        ReclaimDomain::builder()
            .retirement_threshold(4)
            .on_terminate(move |_| {
                terminated.fetch_add(1, Ordering::SeqCst);
            })
            .on_free(move |payload: &'static str| freed.lock().unwrap().push(payload))
            .build()
    };

    let a = domain.new_node("X");
    unsafe {
        // Thread 1 retains: count 2.
        let again = domain.retain(a).unwrap();
        assert_eq!(again, a);
        assert_eq!(a.ref_count(), 2);

        // Thread 1 releases: count 1, gate probe sees a live node.
        assert_eq!(domain.release(a), Some(a));
        assert_eq!(a.ref_count(), 1);
        assert!(!a.is_retired());
        assert_eq!(terminated.load(Ordering::SeqCst), 0);

        // Thread 2 releases: count 0, retired and queued.
        assert_eq!(domain.release(a), None);
        assert!(a.is_retired());
    }
    assert_eq!(terminated.load(Ordering::SeqCst), 1);
    assert_eq!(domain.backlog(), 1);
    assert!(freed.lock().unwrap().is_empty());

    assert_eq!(domain.sweep(true), 1);
    assert_eq!(*freed.lock().unwrap(), vec!["X"]);
    assert_eq!(domain.backlog(), 0);
}

/// 测试4: 仍被链接指向的已退休节点不会被解引用（协议被破坏的情形）
#[test]
fn test_dereference_rejects_retired_but_anchored_node() {
    let freed = Arc::new(AtomicUsize::new(0));
    let domain = {
        let freed = freed.clone();
        ReclaimDomain::builder()
            .retirement_threshold(4)
            .on_free(move |payload: &'static str| {
                assert_eq!(payload, "X");
                freed.fetch_add(1, Ordering::SeqCst);
            })
            .build()
    };
    let link = Link::new();

    let a = domain.new_node("X");
    unsafe {
        domain.store_into(&link, Some(a));
        assert_eq!(a.ref_count(), 2);
        // Give back the creation pin, then wrongly give back the link's anchor too.
        assert_eq!(domain.release(a), Some(a));
        assert_eq!(domain.release(a), None);
    }

    assert!(domain.dereference_allowing_removed(&link).is_none());
    assert!(domain.dereference_skipping_removed(&link).is_none());

    domain.sweep(true);
    assert_eq!(freed.load(Ordering::SeqCst), 1);
    // `link` still holds the freed address; it is never read again.
}

/// 测试5: store_into 在新旧目标之间移动锚
#[test]
fn test_store_into_moves_anchor() {
    let domain = ReclaimDomain::new();
    let link = Link::new();

    let a = domain.new_node('a');
    let b = domain.new_node('b');
    unsafe {
        domain.store_into(&link, Some(a));
        assert_eq!(a.ref_count(), 2);

        domain.store_into(&link, Some(b));
        assert_eq!(a.ref_count(), 1);
        assert_eq!(b.ref_count(), 2);
        assert_eq!(link.load().node(), Some(b));

        assert!(domain.release(a).is_none());
        domain.store_into(&link, None);
        assert_eq!(b.ref_count(), 1);
        assert!(domain.release(b).is_none());
    }
    assert!(link.is_null());
}

/// 测试6: compare_and_swap 期望值过期时失败，计数不变
#[test]
fn test_compare_and_swap_stale_expected() {
    let domain = ReclaimDomain::new();
    let link = Link::new();

    let a = domain.new_node(1);
    let b = domain.new_node(2);
    let c = domain.new_node(3);
    unsafe {
        domain.store_into(&link, Some(c));

        let err = domain
            .compare_and_swap(&link, MarkedPtr::from(a), Some(b))
            .unwrap_err();
        assert_eq!(err.current, MarkedPtr::from(c));
        assert_eq!(a.ref_count(), 1);
        assert_eq!(b.ref_count(), 1);
        assert_eq!(c.ref_count(), 2);
        assert_eq!(link.load().node(), Some(c));

        domain.store_into(&link, None);
        for node in [a, b, c] {
            assert!(domain.release(node).is_none());
        }
    }
}

/// 测试7: compare_and_swap 成功时保留新目标、释放旧目标
#[test]
fn test_compare_and_swap_success() {
    let domain = ReclaimDomain::new();
    let link = Link::new();

    let a = domain.new_node(1);
    let b = domain.new_node(2);
    unsafe {
        let previous = domain
            .compare_and_swap(&link, MarkedPtr::null(), Some(a))
            .unwrap();
        assert!(previous.is_null());
        assert_eq!(a.ref_count(), 2);

        let previous = domain
            .compare_and_swap(&link, MarkedPtr::from(a), Some(b))
            .unwrap();
        assert_eq!(previous.node(), Some(a));
        assert_eq!(a.ref_count(), 1);
        assert_eq!(b.ref_count(), 2);

        domain.compare_and_swap(&link, MarkedPtr::from(b), None).unwrap();
        assert_eq!(b.ref_count(), 1);
        assert!(domain.release(a).is_none());
        assert!(domain.release(b).is_none());
    }
}

/// 测试8: 逻辑删除标记只影响 skip_marked 的解引用
#[test]
fn test_removed_mark_is_orthogonal() {
    let domain = ReclaimDomain::new();
    let link = Link::new();

    let node = domain.insert(7u8);
    domain.store(&link, Some(&node));
    let unmarked = link.load();

    assert!(link.mark(unmarked));
    assert!(link.is_marked());
    assert!(!link.mark(unmarked));
    assert!(!link.mark(link.load()));

    assert!(domain.pin(&link).is_none());
    let through = domain.pin_allowing_removed(&link).unwrap();
    assert_eq!(*through, 7);
    assert_eq!(through.as_ptr(), node.as_ptr());
    // creation pin + anchor + this pin; marking does not touch counts
    assert_eq!(node.ref_count(), 3);
    drop(through);

    // Overwriting clears the mark and releases the anchor.
    domain.store(&link, None);
    assert!(!link.is_marked());
    assert_eq!(node.ref_count(), 1);
}

/// 测试9: Pinned 的克隆与 drop 保持计数平衡
#[test]
fn test_pinned_clone_and_drop_balance() {
    let domain = ReclaimDomain::new();
    let link = Link::new();

    let node = domain.insert(String::from("payload"));
    domain.store(&link, Some(&node));
    assert_eq!(node.ref_count(), 2);

    let first = domain.pin(&link).unwrap();
    let second = first.clone();
    assert_eq!(node.ref_count(), 4);
    assert_eq!(&*second, "payload");

    drop(first);
    drop(second);
    assert_eq!(node.ref_count(), 2);

    drop(node);
    let last = domain.pin(&link).unwrap();
    assert_eq!(last.ref_count(), 2);
    drop(last);
    domain.store(&link, None);
    assert_eq!(domain.retired_count(), 1);
}

/// 测试10: MarkedPtr 的标记位操作
#[test]
fn test_marked_ptr_bits() {
    let domain = ReclaimDomain::new();
    let node = domain.new_node(0u64);

    let plain = MarkedPtr::from(node);
    let marked = plain.with_mark(true);
    assert!(!plain.is_marked());
    assert!(marked.is_marked());
    assert_ne!(plain, marked);
    assert_eq!(marked.node(), Some(node));
    assert_eq!(marked.with_mark(false), plain);
    assert!(!marked.is_null());

    let null = MarkedPtr::<u64>::null();
    assert!(null.is_null());
    assert!(null.with_mark(true).is_null());
    assert!(null.with_mark(true).node().is_none());
    assert_eq!(MarkedPtr::from(None), null);

    unsafe { domain.release(node) };
}

/// 测试11: 域上的负载与计数访问器
#[test]
fn test_domain_payload_and_ref_count() {
    let domain = ReclaimDomain::new();
    let node = domain.new_node(String::from("p"));

    unsafe {
        assert_eq!(domain.payload(Some(node)).map(String::as_str), Some("p"));
        assert!(domain.payload(None).is_none());
        assert_eq!(domain.ref_count(node), 1);
        assert!(domain.release(node).is_none());
    }
}
