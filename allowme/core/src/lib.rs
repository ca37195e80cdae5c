#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod address;
pub mod store;
pub mod update;

pub use self::{
    address::{classify, classify_ip, Address, Rejection},
    store::{AllowList, AllowListStore, MemoryStore, ResourceVersion, Snapshot, StoreError},
    update::{Ensured, RetryPolicy, UpdateError, UpdateMetrics, UpdateOutcome, Updater},
};
pub use ipnet::Ipv4Net;
