pub mod cascade;
pub mod directory;
pub mod dispatcher;
pub mod queue;
pub mod scoring;
pub mod state_machine;
pub mod sweeper;

#[cfg(test)]
pub(crate) mod testing;
