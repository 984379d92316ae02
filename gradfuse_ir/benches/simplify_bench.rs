//! Benchmark for expression construction and tracker lowering, the two
//! hot paths of kernel emission.

use criterion::{criterion_group, criterion_main, Criterion};

use gradfuse_ir::{tune_null, unravel_alu, AluExp, DType, Kernel, ShapeTracker, GIDX};

fn bench_unravel_and_lower(c: &mut Criterion) {
    let shape = [16usize, 32, 8];
    let size: usize = shape.iter().product();

    c.bench_function("unravel_3d", |b| {
        b.iter(|| {
            let gidx = AluExp::special(GIDX, size);
            unravel_alu(&shape, gidx).unwrap()
        })
    });

    c.bench_function("tune_permuted_view", |b| {
        let tracker = ShapeTracker::contiguous(&shape).permute(&[2, 0, 1]).unwrap();
        b.iter(|| {
            let gidx = AluExp::special(GIDX, size);
            let indices = unravel_alu(tracker.shape(), gidx).unwrap();
            let exp =
                AluExp::global_view(0, tracker.clone(), indices, DType::Float32).unwrap();
            let kernel = Kernel {
                nargs: 1,
                size,
                exp,
                reduction: None,
            };
            tune_null(&kernel).unwrap()
        })
    });
}

criterion_group!(benches, bench_unravel_and_lower);
criterion_main!(benches);
