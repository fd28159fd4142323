pub mod metrics;
pub mod posted;
pub mod recommendation;
