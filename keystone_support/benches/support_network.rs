// Criterion benchmarks for the support network hot paths: nearest-node
// queries against a populated octree, placement with node sharing, and a
// tall collapse cascade.

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use keystone_support::config::IndexConfig;
use keystone_support::spatial::SupportIndex;
use keystone_support::{NetworkConfig, NodeId, Rotation, StructureTemplate, SupportNetwork, Vec3};
use std::hint::black_box;

/// 32x4x32 lattice of nodes, one unit apart.
fn lattice() -> SupportIndex {
    let mut index = SupportIndex::new(IndexConfig::default());
    let mut id = 0u64;
    for x in 0..32 {
        for y in 0..4 {
            for z in 0..32 {
                index.insert(NodeId(id), Vec3::new(x as f32, y as f32, z as f32));
                id += 1;
            }
        }
    }
    index
}

fn bench_find_near(c: &mut Criterion) {
    let index = lattice();
    // Deterministic probe positions, half of them near a lattice point.
    let probes: Vec<Vec3> = (0u64..1000)
        .map(|i| {
            let x = (i.wrapping_mul(6364136223846793007) % 3200) as f32 / 100.0;
            let z = (i.wrapping_mul(1442695040888963407) % 3200) as f32 / 100.0;
            let y = (i % 4) as f32;
            Vec3::new(x, y, z)
        })
        .collect();

    c.bench_function("find_near_4k_nodes", |b| {
        b.iter(|| {
            for p in &probes {
                black_box(index.find_near(*p, 0.1));
            }
        });
    });
}

/// Network with a foundation and a `height`-pillar tower on one corner.
fn tower(height: usize) -> (SupportNetwork, keystone_support::StructureId) {
    let mut net = SupportNetwork::new(NetworkConfig::default()).unwrap();
    let foundation = net.register_template(StructureTemplate::foundation()).unwrap();
    let pillar = net.register_template(StructureTemplate::pillar()).unwrap();
    net.add_structure(foundation, Vec3::ZERO, Rotation::IDENTITY).unwrap();
    let mut first = None;
    for k in 0..height {
        let id = net
            .add_structure(pillar, Vec3::new(1.0, 1.0 + 2.0 * k as f32, 1.0), Rotation::IDENTITY)
            .unwrap();
        first.get_or_insert(id);
    }
    (net, first.unwrap())
}

fn bench_place_grid(c: &mut Criterion) {
    c.bench_function("place_16x16_floor_on_foundations", |b| {
        b.iter(|| {
            let mut net = SupportNetwork::new(NetworkConfig::default()).unwrap();
            let slab = net.register_template(StructureTemplate::foundation()).unwrap();
            let panel = net.register_template(StructureTemplate::floor_panel()).unwrap();
            for x in 0..16 {
                for z in 0..16 {
                    let at = Vec3::new(x as f32 * 2.0, 0.0, z as f32 * 2.0);
                    net.add_structure(slab, at, Rotation::IDENTITY).unwrap();
                    net.add_structure(panel, at + Vec3::Y, Rotation::IDENTITY)
                        .unwrap();
                }
            }
            black_box(net.node_count())
        });
    });
}

fn bench_chain_cascade(c: &mut Criterion) {
    c.bench_function("collapse_200_pillar_tower", |b| {
        b.iter_batched(
            || tower(200),
            |(mut net, bottom)| black_box(net.remove_structure(bottom).unwrap()),
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_find_near, bench_place_grid, bench_chain_cascade);
criterion_main!(benches);
