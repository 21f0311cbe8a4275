//! # pcapstitch
//!
//! Command line driver for [`pcapstitch_core`]: reads a capture file and
//! writes every reconstructed (and, where keys allow, decrypted) TCP stream.

pub mod cli;
