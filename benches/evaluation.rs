use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use nlchoice::sampling::{DestinationSampler, SampleUniverse, UniverseElement};
use nlchoice::{
    ChoiceSet, Coefficient, Coefficients, ExecutionMode, RandomStream, SamplingOptions, StreamKey,
};

fn coefficients() -> Arc<Coefficients> {
    Arc::new(
        Coefficients::builder("bench")
            .coefficient(Coefficient::new(0, "utility", 1.0))
            .coefficient(Coefficient::labeled(1, "Nest_auto", 0.7))
            .build()
            .expect("valid table"),
    )
}

fn benchmark_nested_evaluation(c: &mut Criterion) {
    let mut group = c.benchmark_group("nested_evaluation");
    let coefficients = coefficients();

    for alternatives in [10usize, 100, 1000].iter() {
        let mut set = ChoiceSet::new(1, Arc::clone(&coefficients), false);
        let mut stream = RandomStream::new(StreamKey::new(1, 1));
        for index in 0..*alternatives {
            let alternative = set
                .get_alternative(index, true, false)
                .expect("available alternative");
            alternative
                .add_utility_term(0, stream.next_uniform() * 4.0 - 2.0)
                .expect("finite utility");
            if index % 2 == 0 {
                alternative.add_nested_alternative(index % 10, 1);
            }
        }

        group.throughput(Throughput::Elements(*alternatives as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(alternatives),
            alternatives,
            |b, _| {
                b.iter(|| black_box(set.evaluate().expect("evaluation")));
            },
        );
    }

    group.finish();
}

fn benchmark_destination_sampling(c: &mut Criterion) {
    let universe = SampleUniverse::new(
        (0..50_000)
            .map(|id| UniverseElement::new(id, (id % 500) as usize, 1.0 + (id % 13) as f64))
            .collect(),
    )
    .expect("valid universe");
    let sampler = DestinationSampler::new(
        &universe,
        SamplingOptions::default().with_sample_size(50),
        ExecutionMode::Application,
        |zone| 1.0 / (1.0 + zone as f64),
    )
    .expect("valid sampler");

    c.bench_function("sample_50_of_50000", |b| {
        let mut entity = 0;
        b.iter(|| {
            entity += 1;
            let stream = RandomStream::new(StreamKey::new(entity, 1).for_model(20, 0));
            black_box(
                sampler
                    .sample_and_return_tour_destinations(&stream, None)
                    .expect("sample"),
            )
        });
    });
}

criterion_group!(benches, benchmark_nested_evaluation, benchmark_destination_sampling);
criterion_main!(benches);
