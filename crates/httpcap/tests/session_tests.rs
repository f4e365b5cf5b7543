//! Integration tests for the session table
//!
//! Tests identity-checked removal under concurrency and isolation between
//! sessions.

use http::{HeaderMap, Method, Uri};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use httpcap::capture::{CaptureBuffer, Exchange, RequestSnapshot, SessionId, SessionTable};

// =============================================================================
// Test Fixtures
// =============================================================================

fn exchange(id: u64, path: &str) -> Arc<Exchange> {
    let request = RequestSnapshot {
        method: Method::GET,
        uri: format!("http://example.com{path}").parse::<Uri>().unwrap(),
        headers: HeaderMap::new(),
    };
    Arc::new(Exchange::new(
        SessionId::new(id),
        "example.com",
        request,
        CaptureBuffer::new(),
    ))
}

// =============================================================================
// Concurrent Removal Tests
// =============================================================================

mod removal_tests {
    use super::*;

    #[test]
    fn test_concurrent_remove_succeeds_once() {
        for _ in 0..50 {
            let table = Arc::new(SessionTable::new());
            let target = exchange(9, "/");
            table.begin(SessionId::new(9), Arc::clone(&target));

            let wins = Arc::new(AtomicUsize::new(0));
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let table = Arc::clone(&table);
                    let target = Arc::clone(&target);
                    let wins = Arc::clone(&wins);
                    std::thread::spawn(move || {
                        if table.remove(SessionId::new(9), &target) {
                            wins.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(wins.load(Ordering::SeqCst), 1);
            assert!(table.is_empty());
        }
    }

    #[test]
    fn test_stale_exchange_cannot_remove_replacement() {
        let table = SessionTable::new();
        let old = exchange(1, "/old");
        let new = exchange(1, "/new");

        table.begin(SessionId::new(1), Arc::clone(&old));
        let replaced = table.begin(SessionId::new(1), Arc::clone(&new)).unwrap();
        assert!(Arc::ptr_eq(&replaced, &old));

        assert!(!table.remove(SessionId::new(1), &old));
        let current = table.lookup(SessionId::new(1)).unwrap();
        assert_eq!(current.request.uri.path(), "/new");
    }
}

// =============================================================================
// Isolation Tests
// =============================================================================

mod isolation_tests {
    use super::*;

    #[test]
    fn test_sessions_are_independent() {
        let table = Arc::new(SessionTable::new());

        let handles: Vec<_> = (0..16u64)
            .map(|id| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    let mine = exchange(id, &format!("/{id}"));
                    table.begin(SessionId::new(id), Arc::clone(&mine));
                    let found = table.lookup(SessionId::new(id)).unwrap();
                    assert!(Arc::ptr_eq(&found, &mine));
                    assert!(table.remove(SessionId::new(id), &mine));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(table.is_empty());
    }

    #[test]
    fn test_ids_need_not_be_sequential() {
        let table = SessionTable::new();
        for id in [u64::MAX, 0, 1 << 40] {
            table.begin(SessionId::new(id), exchange(id, "/"));
        }
        assert_eq!(table.len(), 3);
        assert!(table.lookup(SessionId::new(1)).is_none());
        assert_eq!(format!("{:06}", SessionId::new(0)), "000000");
    }
}
