use criterion::criterion_main;

mod control;
use crate::control::{bounce_benchmark_group, message_benchmark_group};

// Add the benchmark groups that should be run
criterion_main!(message_benchmark_group, bounce_benchmark_group);
