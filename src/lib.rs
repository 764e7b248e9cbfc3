//! Remote IPAM delegation.
//!
//! A container host runs the `remote-ipam` plugin, which forwards every
//! `ADD`/`DEL` to one central `remote-ipamd` over HTTP. The daemon owns all
//! allocation state, so any number of hosts can draw from the same ranges.
//!
//! * [`client`] turns a plugin invocation into a delegation call.
//! * [`server`] validates delegations and routes them to the allocator.
//! * [`protocol`] holds the query parameters both sides agree on.
//! * [`resolv_conf`] reads the resolver file attached to results.
//! * [`allocator`] is the address bookkeeping behind the daemon.

pub mod allocator;
pub mod client;
pub mod config;
pub mod plugin;
pub mod protocol;
pub mod resolv_conf;
pub mod server;
pub mod types;
