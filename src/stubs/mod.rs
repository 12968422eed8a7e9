pub mod host;
#[cfg(test)]
pub mod runner;
