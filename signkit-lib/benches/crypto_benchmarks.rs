//! Key agreement and envelope benchmarks.
//!
//! Run with: `cargo bench --bench crypto_benchmarks`

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use signkit_lib::crypto::envelope::{decrypt, encrypt};
use signkit_lib::crypto::keys::generate_random_bytes32;
use signkit_lib::crypto::{derive_sym_key, generate_key_pair, hash_key, TYPE_0, TYPE_1};

fn bench_key_pair_generation(c: &mut Criterion) {
    c.bench_function("x25519_key_pair", |b| b.iter(|| black_box(generate_key_pair())));
}

/// X25519 plus HKDF, as done once per settled session.
fn bench_derive_sym_key(c: &mut Criterion) {
    let alice = generate_key_pair();
    let bob = generate_key_pair();
    c.bench_function("derive_sym_key", |b| {
        b.iter(|| {
            derive_sym_key(black_box(&alice.private_key), black_box(&bob.public_key)).unwrap()
        })
    });
}

fn bench_topic_hash(c: &mut Criterion) {
    let key = generate_random_bytes32();
    c.bench_function("hash_key", |b| b.iter(|| hash_key(black_box(&key)).unwrap()));
}

fn bench_envelope_seal(c: &mut Criterion) {
    let key = generate_random_bytes32();
    let sender = generate_key_pair();
    let mut group = c.benchmark_group("envelope_seal");
    for size in [64usize, 1024, 16384] {
        let message = "x".repeat(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("type0_{}", size), |b| {
            b.iter(|| encrypt(&key, black_box(&message), TYPE_0, None).unwrap())
        });
        group.bench_function(format!("type1_{}", size), |b| {
            b.iter(|| {
                encrypt(&key, black_box(&message), TYPE_1, Some(&sender.public_key)).unwrap()
            })
        });
    }
    group.finish();
}

fn bench_envelope_open(c: &mut Criterion) {
    let key = generate_random_bytes32();
    let sealed = encrypt(&key, &"x".repeat(1024), TYPE_0, None).unwrap();
    c.bench_function("envelope_open_1kb", |b| {
        b.iter(|| decrypt(&key, black_box(&sealed)).unwrap())
    });
}

criterion_group!(
    crypto_benches,
    bench_key_pair_generation,
    bench_derive_sym_key,
    bench_topic_hash,
    bench_envelope_seal,
    bench_envelope_open
);
criterion_main!(crypto_benches);
