//! Generated Protocol-Buffer types for the Mumble control channel.

/// Types generated from `proto/Mumble.proto`.
pub mod mumble {
    #![allow(clippy::all)]
    include!(concat!(env!("OUT_DIR"), "/mumble.rs"));
}
