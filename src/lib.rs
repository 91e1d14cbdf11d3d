pub mod action;
pub mod agent;
pub mod backend;
pub mod common;
pub mod graph;
pub mod metrics;
pub mod mutate;
pub mod navigation;
pub mod pprint;
pub mod schedule;
pub mod search;
pub mod serialization;
pub mod tree;
pub mod utils;
