#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod aggregate;
pub mod config;
pub mod data;
pub mod glm;
pub mod lowess;
pub mod percentile;
pub mod pipeline;
pub mod render;
pub mod thresholds;
pub mod types;
