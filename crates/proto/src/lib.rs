//! Protocol implementation for the Capstan SSH library.
//!
//! This crate provides an SSH-2 client: the binary packet protocol, key
//! exchange and rekeying, service dispatch, user authentication, and the
//! channel multiplexer.
//!
//! # Architecture
//!
//! 1. **Packet layer** ([`ssh::buffer`], [`ssh::codec`]) - Binary packet
//!    protocol (RFC 4253 Section 6)
//! 2. **Transport layer** ([`ssh::transport`], [`ssh::kex`]) - Version
//!    exchange, key exchange, encryption, MAC (RFC 4253)
//! 3. **Authentication layer** ([`ssh::userauth`]) - User authentication
//!    (RFC 4252)
//! 4. **Connection layer** ([`ssh::connection`], [`ssh::channel`]) - Channels
//!    and requests (RFC 4254)
//! 5. **Client facade** ([`ssh::client`]) - High-level convenience API
//!
//! # Security
//!
//! - All packet parsing validates size limits (max 256 KiB per packet)
//! - MAC comparison is constant-time
//! - Secrets are zeroized on drop using [`zeroize`]
//! - No `unsafe` code
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod ssh;
