pub mod clock;
pub mod env;
pub mod telemetry;

pub use clock::{Clock, SystemClock};

/// Performs `&str` comparisons in constant time (relative to the input length) so a token check
/// can't leak how many leading bytes of the secret matched
pub fn constant_time_cmp(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    // black_box keeps the optimizer from turning the fold back into an early-exit compare
    let res = a
        .bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (left, right)| {
            acc | std::hint::black_box(left ^ right)
        });

    res == 0
}
