pub mod auth;
pub mod contacts;
pub mod conversations;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod state;

#[cfg(test)]
mod testing;
