use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use image::{DynamicImage, Rgb, RgbImage};
use imgly_upscale::{
    config::EngineConfig, BackendTier, ContentHint, EnhancementEngine, EnhancementPipeline,
    ImageAnalyzer, NaiveUpscaler, NoOpEventSink, QualityScorer, ResourceSnapshot, StagePhase,
    StageRegistry, StaticResourceProbe, UpscaleRequest,
};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

const SIZES: [u32; 3] = [64, 256, 512];

fn synthetic(size: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(size, size, |x, y| {
        let v = ((x * 7 + y * 13) % 200 + 30) as u8;
        Rgb([v, v.wrapping_add(20), 255 - v])
    }))
}

fn benchmark_analysis(c: &mut Criterion) {
    let mut group = c.benchmark_group("analysis");
    let analyzer = ImageAnalyzer::new();
    let scorer = QualityScorer::new(EngineConfig::default().quality);

    for size in SIZES {
        let image = synthetic(size);
        let features = analyzer.analyze(&image);
        group.bench_with_input(BenchmarkId::new("analyze", size), &image, |b, image| {
            b.iter(|| black_box(analyzer.analyze(image)));
        });
        group.bench_with_input(BenchmarkId::new("score", size), &image, |b, image| {
            b.iter(|| black_box(scorer.score(image, &features)));
        });
    }
    group.finish();
}

fn benchmark_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");
    group.sample_size(20);
    let config = EngineConfig::default();
    let registry = StageRegistry::with_builtin_stages();
    let cancel = CancellationToken::new();

    for (label, phases) in [
        ("pre", StagePhase::BEFORE_UPSCALE.to_vec()),
        ("post", vec![StagePhase::PostProcess]),
    ] {
        let pipeline = EnhancementPipeline::from_registry(&registry, &phases);
        let image = synthetic(256);
        let features = ImageAnalyzer::new().analyze(&image);
        let active = pipeline.active_stage_names(&features, &config, ContentHint::Photo);

        group.bench_function(label, |b| {
            b.iter(|| {
                black_box(
                    pipeline
                        .run(image.clone(), &features, &active, &config, ContentHint::Photo, &cancel)
                        .unwrap(),
                )
            });
        });
    }
    group.finish();
}

fn benchmark_naive_fallback(c: &mut Criterion) {
    let mut group = c.benchmark_group("naive_fallback");
    let upscaler = NaiveUpscaler::new(EngineConfig::default().backends.naive_fallback);

    for size in SIZES {
        let image = synthetic(size).to_rgb8();
        group.bench_with_input(BenchmarkId::new("x2", size), &image, |b, image| {
            b.iter(|| black_box(upscaler.upscale(image, (size * 2, size * 2))));
        });
    }
    group.finish();
}

fn benchmark_orchestration(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let engine = EnhancementEngine::builder()
        .resource_probe(Arc::new(StaticResourceProbe(ResourceSnapshot::cpu_only())))
        .event_sink(Arc::new(NoOpEventSink))
        .build()
        .unwrap();

    let mut group = c.benchmark_group("orchestration");
    group.sample_size(10);
    let image = synthetic(128);
    group.bench_function(BenchmarkId::new("enhance", BackendTier::NaiveFallback), |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(
                    engine
                        .enhance(UpscaleRequest::new(image.clone(), 2))
                        .await
                        .unwrap(),
                )
            })
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    benchmark_analysis,
    benchmark_pipeline,
    benchmark_naive_fallback,
    benchmark_orchestration
);
criterion_main!(benches);
