pub mod comparison;
pub mod domain;
pub mod pipeline;
pub mod traits;
