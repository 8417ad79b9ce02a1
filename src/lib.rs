pub mod config;
pub mod db;
pub mod error;
pub mod mailbox;
pub mod models;
pub mod poller;
pub mod retry;
pub mod signing;
pub mod store;
pub mod webhook;
