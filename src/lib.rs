//! dockgate: a web gateway for managing a single Docker host.
//!
//! Signed-in users browse containers, logs and host metrics; admins also
//! create and change containers, manage images, edit files under the volume
//! root and maintain the sign-in allow-list.

pub mod auth;
pub mod config;
pub mod db;
pub mod docker;
pub mod error;
pub mod files;
pub mod server;
pub mod sse;
pub mod system;

pub use config::Config;
pub use error::{Error, Result};
