//! Frequency ranking and bounded eviction.

use uuid::Uuid;
use watchpost::aggregate::Aggregator;
use watchpost::event::{Attributes, Event, EventFactory, EventType};

fn event(factory: &EventFactory, kind: EventType, primary: Option<&str>) -> Event {
    let attrs = match primary {
        Some(v) => Attributes::new().with("target", v).with("extra", "ignored"),
        None => Attributes::new(),
    };
    factory.build(1, kind, None, attrs)
}

#[test]
fn snapshot_orders_by_count_then_key() {
    let factory = EventFactory::new(Uuid::new_v4());
    let agg = Aggregator::new(100);
    for (host, n) in [("b", 3), ("a", 5), ("c", 3)] {
        for _ in 0..n {
            agg.record(&event(&factory, EventType::SocketConnect, Some(host)));
        }
    }
    let snapshot = agg.snapshot();
    let ranked: Vec<(&str, u64)> = snapshot
        .iter()
        .map(|r| (r.identity_key.as_str(), r.count))
        .collect();
    assert_eq!(
        ranked,
        vec![
            ("SOCKET_CONNECTa", 5),
            ("SOCKET_CONNECTb", 3),
            ("SOCKET_CONNECTc", 3)
        ]
    );
    assert_eq!(agg.top(1).len(), 1);
    assert_eq!(agg.top(10).len(), 3);
}

#[test]
fn identity_key_uses_type_and_primary_attribute() {
    let factory = EventFactory::new(Uuid::new_v4());
    let agg = Aggregator::new(100);
    agg.record(&event(&factory, EventType::FileRead, Some("/etc/hosts")));
    agg.record(&event(&factory, EventType::FileWrite, Some("/etc/hosts")));
    agg.record(&event(&factory, EventType::ApiCall, None));

    assert_eq!(agg.len(), 3);
    assert_eq!(agg.get("FILE_READ/etc/hosts").unwrap().count, 1);
    let api = agg.get("API_CALL").unwrap();
    assert_eq!(api.event_type, EventType::ApiCall);
}

#[test]
fn last_seen_tracks_the_latest_capture() {
    let factory = EventFactory::new(Uuid::new_v4());
    let agg = Aggregator::new(10);
    let mut late = event(&factory, EventType::Permission, Some("p"));
    late.timestamp_millis = 2_000;
    let mut early = event(&factory, EventType::Permission, Some("p"));
    early.timestamp_millis = 1_000;
    agg.record(&late);
    agg.record(&early);
    let record = agg.get("PERMISSIONp").unwrap();
    assert_eq!(record.count, 2);
    assert_eq!(record.last_seen, 2_000);
}

#[test]
fn cap_evicts_least_frequent_then_least_recent() {
    let factory = EventFactory::new(Uuid::new_v4());
    let agg = Aggregator::new(3);
    for _ in 0..3 {
        agg.record(&event(&factory, EventType::FileRead, Some("/hot")));
    }
    agg.record(&event(&factory, EventType::FileRead, Some("/cold-old")));
    agg.record(&event(&factory, EventType::FileRead, Some("/cold-new")));

    agg.record(&event(&factory, EventType::FileRead, Some("/fresh")));
    assert_eq!(agg.len(), 3);
    assert_eq!(agg.evicted(), 1);
    assert!(agg.get("FILE_READ/cold-old").is_none());
    assert!(agg.get("FILE_READ/cold-new").is_some());
    assert_eq!(agg.get("FILE_READ/hot").unwrap().count, 3);

    // Existing keys never evict.
    agg.record(&event(&factory, EventType::FileRead, Some("/hot")));
    assert_eq!(agg.evicted(), 1);
}

#[test]
fn eviction_follows_counts_as_they_change() {
    let factory = EventFactory::new(Uuid::new_v4());
    let agg = Aggregator::new(2);
    agg.record(&event(&factory, EventType::FileRead, Some("/a")));
    agg.record(&event(&factory, EventType::FileRead, Some("/b")));
    agg.record(&event(&factory, EventType::FileRead, Some("/a")));

    agg.record(&event(&factory, EventType::FileRead, Some("/c")));
    assert!(agg.get("FILE_READ/b").is_none());

    // /c is now the coldest; a second newcomer replaces it, not /a.
    agg.record(&event(&factory, EventType::FileRead, Some("/d")));
    assert!(agg.get("FILE_READ/c").is_none());
    assert_eq!(agg.get("FILE_READ/a").unwrap().count, 2);
    assert_eq!(agg.get("FILE_READ/d").unwrap().count, 1);
    assert_eq!(agg.evicted(), 2);

    // Many distinct keys through a small cap keep the index consistent.
    for i in 0..1_000 {
        agg.record(&event(&factory, EventType::ApiCall, Some(&format!("k{}", i))));
    }
    assert_eq!(agg.len(), 2);
    assert_eq!(agg.evicted(), 1_002);
    assert!(agg.get("FILE_READ/a").is_some());
}

#[test]
fn concurrent_records_are_all_counted() {
    let agg = std::sync::Arc::new(Aggregator::new(100));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let agg = agg.clone();
            std::thread::spawn(move || {
                let factory = EventFactory::new(Uuid::new_v4());
                for _ in 0..250 {
                    agg.record(&event(&factory, EventType::SocketBind, Some("0.0.0.0")));
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(agg.get("SOCKET_BIND0.0.0.0").unwrap().count, 1000);
}
