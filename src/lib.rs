//! Client for the Streamlabs desktop remote-control API and a companion
//! engine that confirms live broadcast lifecycle transitions.

pub mod broadcast;
pub mod codec;
pub mod config;
pub mod error;
pub mod framing;
pub mod model;
pub mod remote;
pub mod session;
