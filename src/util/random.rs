use rand::Rng;
use std::ops::Range;


/// Source of randomness, abstracted so that code depending on random choices can be tested
///  with fixed values
#[cfg_attr(test, mockall::automock)]
pub trait Random: Send + Sync + 'static {
    fn gen_usize_range(&self, range: Range<usize>) -> usize;
}

pub struct RngRandom {}
impl Random for RngRandom {
    fn gen_usize_range(&self, range: Range<usize>) -> usize {
        rand::rng().random_range(range)
    }
}
