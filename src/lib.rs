//! Idlegate - An idle-aware gateway for an on-demand Minecraft server
//!
//! This library provides a gateway that:
//! - Listens on the public Minecraft port in front of a backend server
//! - Answers server-list pings with synthetic status while the backend is down
//! - Requests a backend start when a player tries to log in
//! - Splices raw TCP between client and backend once it is confirmed alive
//! - Monitors backend liveness by polling its status endpoint
//! - Requests a backend stop after a configurable period with zero players

pub mod command;
pub mod config;
pub mod gateway;
pub mod monitor;
pub mod protocol;
pub mod proxy;
