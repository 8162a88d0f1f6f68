use std::io::{stderr, Stderr};
use std::time::Instant;

pub(crate) type ProgressBar = pbr::ProgressBar<Stderr>;

pub(crate) fn create_progress_bar(total: u64) -> ProgressBar {
    ProgressBar::on(stderr(), total)
}

pub(crate) fn elapsed_secs(start: &Instant) -> f64 {
    start.elapsed().as_secs_f64()
}
