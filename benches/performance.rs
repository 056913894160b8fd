use cgmath::Vector3;
use criterion::{criterion_group, criterion_main, Criterion};

use hashdag::{
    AabbEditor, ColorConfig, ColorPool, NodeConfig, NodePointer, NodePool, RGB8Color, SphereEditor,
    VBRColor,
};

fn bench_node_config() -> NodeConfig {
    // a 256^3 world keeps the benches fast while still exercising the
    // parallel fan-out
    NodeConfig {
        level_count: 8,
        top_level_count: 4,
        word_bits_per_page: 10,
        page_bits_per_bucket: 2,
        bucket_bits_per_top_level: 4,
        bucket_bits_per_bottom_level: 7,
    }
}

fn bench_color_config() -> ColorConfig {
    ColorConfig {
        leaf_level: 2,
        node_bits_per_node_page: 8,
        word_bits_per_leaf_page: 12,
        keep_history: false,
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    let threads = rayon::ThreadPoolBuilder::new().build().unwrap();

    c.bench_function("sphere fill into empty world", |b| {
        let editor = SphereEditor::fill(
            Vector3::new(128, 128, 128),
            100,
            VBRColor::solid(RGB8Color(0xFF8800)),
        );
        b.iter_batched(
            || NodePool::new(bench_node_config()).unwrap(),
            |pool| pool.edit(&threads, NodePointer::NULL, &editor).unwrap(),
            criterion::BatchSize::LargeInput,
        );
    });

    c.bench_function("repeated identical fill (dedup hit path)", |b| {
        let pool = NodePool::new(bench_node_config()).unwrap();
        let editor = SphereEditor::fill(
            Vector3::new(128, 128, 128),
            100,
            VBRColor::solid(RGB8Color(0xFF8800)),
        );
        let root = pool.edit(&threads, NodePointer::NULL, &editor).unwrap();
        b.iter(|| {
            let again = pool.edit(&threads, root, &editor).unwrap();
            assert_eq!(again, root);
        });
    });

    c.bench_function("fused color fill", |b| {
        let config = bench_node_config();
        let editor = AabbEditor {
            min: Vector3::new(10, 10, 10),
            max: Vector3::new(200, 150, 100),
            color: VBRColor::solid(RGB8Color(0x3366CC)),
        };
        b.iter_batched(
            || {
                (
                    NodePool::new(config.clone()).unwrap(),
                    ColorPool::new(bench_color_config(), &config).unwrap(),
                )
            },
            |(pool, colors)| {
                pool.edit_with_colors(
                    &threads,
                    NodePointer::NULL,
                    &colors,
                    colors.get_root(),
                    &editor,
                )
                .unwrap()
            },
            criterion::BatchSize::LargeInput,
        );
    });

    c.bench_function("gc after edits", |b| {
        let editor = SphereEditor::fill(
            Vector3::new(128, 128, 128),
            90,
            VBRColor::solid(RGB8Color(0xFF8800)),
        );
        let dig = SphereEditor::dig(Vector3::new(100, 128, 128), 60);
        b.iter_batched(
            || {
                let pool = NodePool::new(bench_node_config()).unwrap();
                let mut root = pool.edit(&threads, NodePointer::NULL, &editor).unwrap();
                root = pool.edit(&threads, root, &dig).unwrap();
                (pool, root)
            },
            |(mut pool, root)| pool.gc(&threads, root).unwrap(),
            criterion::BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
