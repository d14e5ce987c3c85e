//! Fleet Cloud - Virtual machine backends for runners
//!
//! [`CloudRunnerManager`] is the capability interface the runner manager uses
//! to provision, list and delete runner instances. Backends:
//!
//! - [`OpenStackCloud`]: Keystone v3 + Nova REST API
//! - [`InMemoryCloud`]: development and testing

#![deny(unsafe_code)]

pub mod error;
pub mod manager;
pub mod memory;
pub mod openstack;

pub use error::{CloudError, CloudResult};
pub use manager::CloudRunnerManager;
pub use memory::InMemoryCloud;
pub use openstack::{OpenStackCloud, OpenStackConfig};
