//! One-time secret links whose key never leaves the people sharing them.
//!
//! The sender encrypts locally ([`envelope`]), uploads only ciphertext
//! ([`client`]), and hands out a [`link::ShareLink`] whose fragment carries
//! the key. The recipient opens it once through a [`viewer::ViewingSession`],
//! which consumes the server copy and destroys the local one when viewing ends.

pub mod client;
pub mod envelope;
pub mod guard;
pub mod link;
pub mod viewer;

pub use client::{Client, ClientError, Opened, Payload};
pub use envelope::{CryptoError, SecretKey};
pub use link::{LinkError, ShareLink};
pub use viewer::{DestroyReason, SessionState, ViewError, ViewPolicy, ViewingSession};
