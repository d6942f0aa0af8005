//! Server key custody and the encrypted request envelope.
//!
//! An envelope carries one random AES-256-GCM session key, wrapped for the
//! server with ECIES (secp256k1), plus any number of fields encrypted under
//! that session key:
//!
//! ```json
//! {
//!   "capsules": { "box": "<base64 ECIES(session key)>" },
//!   "data": { "apiKey": { "ciphertext": "<base64>", "iv": "<base64 12 bytes>" } },
//!   "code": { "ciphertext": "<base64>", "iv": "<base64 12 bytes>" }
//! }
//! ```

pub mod keys;
pub mod session;
pub mod unwrap;

pub use keys::{DEV_SECRET_HEX, KeyError, KeySource, KeyStore};
pub use session::{SealedField, SessionKey};
pub use unwrap::{EnvelopeError, Unwrapped, seal, try_unwrap_envelope};
