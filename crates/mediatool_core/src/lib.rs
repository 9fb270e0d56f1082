pub mod alt_text;
pub mod api;
pub mod backup;
pub mod config;
pub mod confirm;
pub mod content;
pub mod convert;
pub mod executor;
pub mod filesystem;
pub mod identifier;
pub mod index;
pub mod journal;
pub mod migrate;
pub mod pipeline;
pub mod plan;
pub mod reachability;
pub mod relocate;
pub mod report;
pub mod runtime;

#[cfg(test)]
mod test_support;
