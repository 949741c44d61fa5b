pub mod driver;
pub mod events;
pub mod identity;
pub mod lease;

#[cfg(test)]
mod cluster_tests;
