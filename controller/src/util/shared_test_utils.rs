
#[cfg(test)]
pub use helpers::*;
