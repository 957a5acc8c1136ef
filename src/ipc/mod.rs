//! HTTP/1.1-over-Unix-socket plumbing for the Discord bot sidecar contract
//! (spec.md §6: `sockets/core-{instance}.sock` inbound, `sockets/discord-
//! {instance}.sock` outbound).

pub mod unix_http;
