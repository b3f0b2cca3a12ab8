//! This module holds policies, which are entities that allow configuring
//! the driver's behaviour in various aspects. The common feature of all policies
//! is that users can implement a policy on their own (because they simply need
//! to implement a certain trait), allowing flexible customizability of the driver.
//!
//! This includes:
//! - address translation of addresses advertised by the nodes,
//! - load balancing, which decides host distances and connection order,
//! - reconnection, which spaces out attempts to reach an unreachable host.

pub mod address_translator;
pub mod load_balancing;
pub mod reconnection;
