use etude_core::SharedCounters;
use etude_core::syscalls::{self, Fork};
use etude_core::Value;

const PER_CHILD: i64 = 10_000;

fn exited_cleanly(status: libc::c_int) -> bool {
    libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0
}

/// Run `body` in a forked child and return its pid. The child never
/// returns into the test harness.
fn spawn(body: impl FnOnce() -> bool) -> libc::pid_t {
    match syscalls::fork().unwrap() {
        Fork::Parent(pid) => pid,
        Fork::Child => {
            let code = if body() { 0 } else { 1 };
            unsafe { libc::_exit(code) }
        }
    }
}

#[test]
fn test_concurrent_increments_from_two_processes() {
    let store = SharedCounters::anonymous().unwrap();
    store.set("total_connections", 0i64).unwrap();

    let children: Vec<_> = (0..2)
        .map(|_| {
            spawn(|| (0..PER_CHILD).all(|_| store.increment("total_connections", 1).is_ok()))
        })
        .collect();

    for pid in children {
        let status = syscalls::reap(pid).unwrap();
        assert!(exited_cleanly(status));
    }
    assert_eq!(store.get("total_connections"), Some(Value::Int(2 * PER_CHILD)));
}

#[test]
fn test_child_attaches_to_named_store_by_key() {
    let key = format!("itest-attach-{}", std::process::id());
    let store = SharedCounters::create(&key).unwrap();
    store.set("workers", 1i64).unwrap();

    let pid = spawn(|| {
        let Ok(attached) = SharedCounters::attach(&key) else {
            return false;
        };
        attached.increment("workers", 2).is_ok() && attached.set("pid", 7i64).is_ok()
    });
    assert!(exited_cleanly(syscalls::reap(pid).unwrap()));

    assert_eq!(store.get("workers"), Some(Value::Int(3)));
    assert_eq!(store.get("pid"), Some(Value::Int(7)));
    store.remove().unwrap();
}

#[test]
fn test_transaction_is_atomic_across_processes() {
    let store = SharedCounters::anonymous().unwrap();
    store.set("a", 0i64).unwrap();
    store.set("b", 0i64).unwrap();

    // Each child moves one unit from a to b under a single lock; the sum
    // is invariant at every observation point.
    let children: Vec<_> = (0..2)
        .map(|_| {
            spawn(|| {
                (0..2_000).all(|_| {
                    store
                        .transaction(|tx| {
                            let a = tx.get("a").and_then(|v| v.as_int()).unwrap_or(0);
                            let b = tx.get("b").and_then(|v| v.as_int()).unwrap_or(0);
                            if a + b != 0 {
                                return false;
                            }
                            tx.set("a", a - 1).is_ok() && tx.set("b", b + 1).is_ok()
                        })
                        .unwrap_or(false)
                })
            })
        })
        .collect();

    for pid in children {
        assert!(exited_cleanly(syscalls::reap(pid).unwrap()));
    }
    assert_eq!(store.get("a"), Some(Value::Int(-4_000)));
    assert_eq!(store.get("b"), Some(Value::Int(4_000)));
}
