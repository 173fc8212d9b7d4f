// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use resilient_judge::{criteria, CacheKey, CircuitBreaker, CircuitBreakerConfig, ErrorCategory, ErrorClassifier, MultiCriteriaEngine};
use tokio::runtime::Runtime;

fn bench_cache_key_compute(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_key_compute");

    for len in [16usize, 256, 4096].iter() {
        let prompt = "Explain the significance of retry budgets. ".repeat(len / 44 + 1);
        group.throughput(Throughput::Bytes(*len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &prompt, |b, prompt| {
            b.iter(|| CacheKey::compute(black_box(prompt), black_box("evaluate"), black_box("fp-balanced")));
        });
    }

    group.finish();
}

fn bench_error_classification(c: &mut Criterion) {
    let classifier = ErrorClassifier::new();
    let messages = [
        "rate limit exceeded, please retry after 30s",
        "connection timed out while waiting for response",
        "invalid api key provided",
        "the server returned a 503 service unavailable",
        "something unrecognizable went wrong",
    ];

    let mut group = c.benchmark_group("error_classification");
    for message in messages.iter() {
        group.bench_with_input(BenchmarkId::from_parameter(message), message, |b, message| {
            b.iter(|| classifier.classify(black_box(message), None));
        });
    }
    group.finish();
}

fn bench_circuit_breaker_allow(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let breaker = CircuitBreaker::new("bench", CircuitBreakerConfig::default());

    c.bench_function("circuit_breaker_allow_closed", |b| {
        b.iter(|| rt.block_on(breaker.allow()));
    });

    c.bench_function("circuit_breaker_record_success", |b| {
        b.iter(|| rt.block_on(breaker.record_success()));
    });

    c.bench_function("circuit_breaker_record_failure", |b| {
        b.iter(|| rt.block_on(breaker.record_failure(black_box(ErrorCategory::Transient))));
    });
}

fn bench_multi_criteria_parse(c: &mut Criterion) {
    let criteria = criteria::balanced();
    let response = r#"Here is my evaluation:
    {
      "criterion_scores": [
        {"criterion_name": "accuracy", "score": 4, "reasoning": "Mostly correct with minor omissions.", "confidence": 0.85},
        {"criterion_name": "completeness", "score": 3, "reasoning": "Missing edge cases.", "confidence": 0.7},
        {"criterion_name": "clarity", "score": 4, "reasoning": "Clear, well organized.", "confidence": 0.8},
        {"criterion_name": "relevance", "score": 5, "reasoning": "Directly answers the prompt.", "confidence": 0.9},
        {"criterion_name": "helpfulness", "score": 4, "reasoning": "Actionable guidance.", "confidence": 0.8},
        {"criterion_name": "coherence", "score": 4, "reasoning": "Logically structured.", "confidence": 0.75},
        {"criterion_name": "appropriateness", "score": 5, "reasoning": "Tone fits the audience.", "confidence": 0.9}
      ],
      "overall_reasoning": "Strong, well-rounded response.",
      "strengths": ["clear", "relevant"],
      "weaknesses": ["misses a few edge cases"],
      "suggestions": ["cover boundary conditions"]
    }
    That concludes my assessment."#;

    c.bench_function("multi_criteria_parse_response", |b| {
        b.iter(|| MultiCriteriaEngine::parse_response(black_box(response), black_box(&criteria), black_box("bench-model")));
    });

    c.bench_function("multi_criteria_build_prompt", |b| {
        b.iter(|| {
            MultiCriteriaEngine::build_prompt(
                black_box("What is the capital of France?"),
                black_box("The capital of France is Paris."),
                black_box(&criteria),
            )
        });
    });
}

criterion_group!(
    benches,
    bench_cache_key_compute,
    bench_error_classification,
    bench_circuit_breaker_allow,
    bench_multi_criteria_parse
);

criterion_main!(benches);
