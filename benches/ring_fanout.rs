//! Ring buffer fan-out benchmark: one writer, many cursors.

use criterion::{ criterion_group, criterion_main, BenchmarkId, Criterion };

use srt_relay::constants::{ DEFAULT_RING_CAPACITY, TS_DATAGRAM_LEN };
use srt_relay::ringbuf::{ CursorStart, ReadOutcome, RingBuffer };

fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_fanout");
    for readers in [1usize, 4, 16] {
        group.bench_with_input(
            BenchmarkId::from_parameter(readers),
            &readers,
            |b, &readers| {
                let ring = RingBuffer::new(DEFAULT_RING_CAPACITY).unwrap();
                let datagram = vec![0x47u8; TS_DATAGRAM_LEN];
                let mut cursors: Vec<_> = (0..readers)
                    .map(|_| ring.new_cursor(CursorStart::Latest))
                    .collect();
                let mut out = vec![0u8; TS_DATAGRAM_LEN];

                b.iter(|| {
                    ring.write(&datagram).unwrap();
                    for cursor in cursors.iter_mut() {
                        match ring.read(cursor, &mut out) {
                            ReadOutcome::Data(n) => assert_eq!(n, TS_DATAGRAM_LEN),
                            other => panic!("unexpected outcome {other:?}"),
                        }
                    }
                });
            }
        );
    }
    group.finish();
}

fn bench_writer_alone(c: &mut Criterion) {
    c.bench_function("ring_write_1316", |b| {
        let ring = RingBuffer::new(DEFAULT_RING_CAPACITY).unwrap();
        let datagram = vec![0x47u8; TS_DATAGRAM_LEN];
        b.iter(|| {
            ring.write(&datagram).unwrap();
        });
    });
}

criterion_group!(benches, bench_fanout, bench_writer_alone);
criterion_main!(benches);
