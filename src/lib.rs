//! Multitenant virtual-network CNI plugin for cloud-hosted Kubernetes nodes.
//!
//! The binary is invoked once per container event by the runtime. The
//! [`cni::Plugin`] dispatcher reads the CNI environment and the network
//! configuration from stdin, serializes the invocation against concurrent
//! ones through a file lock, drives address allocation through a
//! polymorphic IPAM invoker, materializes networks and endpoints through
//! the [`network::NetworkManager`], and writes the CNI result or error
//! document to stdout.
//!
//! Address allocation has two backends: delegation to another CNI plugin on
//! disk ([`ipam_delegate`]) and the node's network control service
//! ([`ipam_cns`]). Multi-tenant pods additionally resolve a per-pod network
//! container goal state ([`multitenancy`]); baremetal nodes hand the whole
//! invocation to a node-local service ([`nns`]).

pub mod cni;
pub mod cns;
pub mod endpoint;
pub mod error;
pub mod ipam;
pub mod ipam_cns;
pub mod ipam_delegate;
pub mod lock;
pub mod multitenancy;
pub mod network;
pub mod nns;
pub mod platform;
pub mod policy;
pub mod store;
pub mod types;
pub mod version;
