#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(unused_variables)]

pub mod actor;
pub mod config;
pub mod critic;
pub mod metrics;
pub mod net;
pub mod replay;
pub mod task;
pub mod training;
