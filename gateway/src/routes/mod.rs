pub mod admin;
pub mod health;
pub mod inference;
pub mod models;
pub mod registry;
