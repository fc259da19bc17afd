//! HMAC-SHA256 signing: callback tokens and inbound adapter signatures.

pub mod inbound;
pub mod token;

pub use inbound::{InboundSignatureValidator, SignatureError};
pub use token::HmacCallbackTokens;
