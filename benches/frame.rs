//! Wire frame benchmark: encode and decode one event.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use uuid::Uuid;
use watchpost::event::{Attributes, EventFactory, EventType};
use watchpost::frame::{decode_frame, encode_frame, DEFAULT_MAX_FRAME_LEN};

fn bench_frame(c: &mut Criterion) {
    let event = EventFactory::new(Uuid::new_v4()).build(
        7,
        EventType::FileRead,
        Some("service.rs:118".into()),
        Attributes::new()
            .with("path", r"C:\data\report,final=2.csv")
            .with("mode", "r")
            .with("status", "ok"),
    );
    let mut buf = Vec::with_capacity(256);
    encode_frame(&event, &mut buf);

    c.bench_function("frame_encode", |b| {
        b.iter(|| {
            let mut out = Vec::with_capacity(256);
            encode_frame(black_box(&event), &mut out);
            out
        })
    });

    c.bench_function("frame_decode", |b| {
        b.iter(|| decode_frame(black_box(&buf), DEFAULT_MAX_FRAME_LEN).unwrap())
    });
}

criterion_group!(benches, bench_frame);
criterion_main!(benches);
