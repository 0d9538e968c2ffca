/// Benchmarks for the binary codec.
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tilestack::codec;
use tilestack::image::ImageArray;
use tilestack::source::MemorySource;

fn criterion_benchmark(c: &mut Criterion) {
    for size_k in [64, 256, 1024] {
        let size = size_k * 1024;
        let data: Vec<f32> = (0..size).map(|i| i as f32 * 0.5).collect();
        let image =
            ImageArray::from_memory(MemorySource::from_vec(data, vec![1, 4, size / 1024, 256, 1]).unwrap())
                .unwrap();
        let name = format!("encode({})", size);
        c.bench_function(&name, |b| {
            b.iter(|| codec::encode(black_box(&image)).unwrap())
        });
        let (bytes, descriptor) = codec::encode(&image).unwrap();
        let name = format!("decode({})", size);
        c.bench_function(&name, |b| {
            b.iter(|| codec::decode(black_box(&bytes), &descriptor).unwrap())
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
