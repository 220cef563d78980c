pub mod grid;
pub mod math;
