pub mod comparator;
pub mod generator;
pub mod runner;
