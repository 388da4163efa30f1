//! Updraft - verified update delivery for self-published artifacts
//!
//! The server side scrapes a directory listing, keeps the latest artifact's
//! metadata and fans out push notifications. The client side downloads the
//! artifact, checks its digest and pins the publisher's signer.

pub mod engine;
