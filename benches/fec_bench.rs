use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use lzrescue::fec::gf16::rs16_encode;
use lzrescue::fec::gf8::rs8_encode;

fn parity_generation(c: &mut Criterion) {
    const FBS: usize = 65536;
    const K: usize = 16;
    let prodata: Vec<u8> = (0..K * FBS).map(|i| (i as u32).wrapping_mul(2654435761) as u8).collect();
    let mut fec_block = vec![0u8; FBS];

    let mut group = c.benchmark_group("parity");
    group.throughput(Throughput::Bytes((K * FBS) as u64));
    group.bench_function("rs8_encode", |b| {
        b.iter(|| rs8_encode(&prodata, None, &mut fec_block, FBS, 7, K))
    });
    group.bench_function("rs16_encode", |b| {
        b.iter(|| rs16_encode(&prodata, None, &mut fec_block, FBS, 7, K))
    });
    group.finish();
}

criterion_group!(benches, parity_generation);
criterion_main!(benches);
