#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use allowme_core as core;
pub use allowme_k8s as k8s;

mod args;
mod metrics;
pub mod server;
mod termination;

pub use self::{args::Args, metrics::RequestMetrics, server::NewAllowMe};
