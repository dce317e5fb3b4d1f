/*
Parsing versus evaluating user equations. Conversions and equation maths parse once and
evaluate every cycle, so evaluation is the number that matters.
*/

use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use greenhouse_control::math::equation::Expression;

const FAHRENHEIT: &str = "x*(9/5)+32";
const NESTED: &str = "((x-32)*5/9)**2 * 0.0012 + (x % 7) / (1 + -(x/100)**3)";

fn equation_parse_bench(c: &mut Criterion) {
    c.bench_function("equation_parse", |b| {
        b.iter(|| Expression::parse(black_box(NESTED)))
    });
}

fn equation_eval_bench(c: &mut Criterion) {
    let simple = Expression::parse(FAHRENHEIT).unwrap();
    let nested = Expression::parse(NESTED).unwrap();
    c.bench_function("equation_eval_linear", |b| b.iter(|| simple.eval(black_box(21.5))));
    c.bench_function("equation_eval_nested", |b| b.iter(|| nested.eval(black_box(55.0))));
}

criterion_group!(benches, equation_parse_bench, equation_eval_bench);
criterion_main!(benches);
