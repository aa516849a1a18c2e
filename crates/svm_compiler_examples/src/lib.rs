#![forbid(unsafe_code)]

mod report;

pub use report::{init_tracing, print_program, print_scene};
