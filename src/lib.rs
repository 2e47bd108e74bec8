pub mod broker;
pub mod browser;
pub mod cli;
pub mod crawler;
pub mod error;
pub mod fetcher;
pub mod orchestrator;
pub mod storage;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;
