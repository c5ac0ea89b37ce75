//! A sans-io AMQP 1.0 protocol engine, restricted to the subset peer
//! messaging needs: one connection, one session, one sender link and one
//! receiver link, unsettled transfers with explicit dispositions, SASL PLAIN
//! authentication, and idle-timeout heartbeats.
//!
//! The [`Engine`](engine::Engine) never touches a socket. The owning
//! connection task feeds it bytes read from the wire with `feed_inbound`,
//! writes out whatever `drain_outbound` produces, and reacts to the events
//! it emits. This keeps the engine single-threaded by construction; all
//! concurrency lives in the caller.

/// AMQP 1.0 primitive type encoding and decoding.
pub mod codec;
/// The protocol state machine.
pub mod engine;
/// Frames, performatives, and message sections.
pub mod frames;
/// Application-level message types.
pub mod message;
