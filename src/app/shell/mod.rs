pub mod backend;
pub mod gate;
pub mod helper_client;
pub mod helper_service;
pub mod manager;
pub mod protocol;
pub mod root;
pub mod runner;

#[cfg(test)]
pub mod testing;
