//! Message security for the Courier messaging middleware.
//!
//! Two concerns, composable independently through [`SecureBroker`]:
//!
//! - **Payload encryption** ([`encryption`]): AES-256-GCM with a named
//!   key registry; the wire payload becomes a JSON
//!   `{iv, ciphertext, tag, key_id}` envelope and the headers note the
//!   algorithm and key id.
//! - **Authentication** ([`auth`]): bearer-token validation (shared
//!   secret or pinned issuer/audience) before handlers run; verified
//!   claims ride on the [`courier_core::context::MessageContext`].
//!
//! Key issuance and rotation are out of scope — keys arrive from the
//! host, already provisioned.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod encryption;
pub mod secure_broker;

pub use auth::Authenticator;
pub use encryption::{EncryptedEnvelope, MessageEncryptor};
pub use secure_broker::SecureBroker;
