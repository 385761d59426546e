pub mod audit;
pub mod catalog;
pub mod compute;
pub mod core;
pub mod marks;
pub mod outcomes;
pub mod results;
pub mod setup;
pub mod workflow;
