//! Generated protobuf message types for the control channel and the
//! encrypted-session payloads. See `proto/et.proto`.

#![allow(clippy::derive_partial_eq_without_eq)]

include!(concat!(env!("OUT_DIR"), "/et.rs"));
