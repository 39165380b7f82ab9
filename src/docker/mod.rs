//! Docker engine access.
//!
//! Handlers talk to the daemon through [`DockerFacade`] so tests can swap in
//! an in-memory engine. [`BollardFacade`] is the real implementation over the
//! local socket.

pub mod connections;
pub mod demux;
mod error;
mod facade;
pub mod types;

pub use connections::{ConnectionCounts, parse_netstat};
pub use error::{DockerError, Result};
pub use facade::{BollardFacade, ByteStream, DockerFacade, EventStream, JsonStream};
pub use types::{
    ContainerDetails, ContainerListItem, ContainerSpec, CreatedContainer, DockerEvent, ImageInfo,
    PortMapping,
};
