#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod auth;
pub mod authorization;
pub mod cli;
pub mod client;
pub mod clock;
pub mod config;
pub mod conversation;
pub mod error;
pub mod gateway;
pub mod workflow;

pub use client::Client;
pub use error::{Error, Result};
