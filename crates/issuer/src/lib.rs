//! Reference token issuer.
//!
//! Signs blinded confirmation tokens, proves each batch with a DLEQ proof and accepts
//! payment-token spends with double-spend detection. Meant for local development and
//! end-to-end tests of the confirmations service.

pub mod config;
pub mod error;
pub mod server;
pub mod signer;
pub mod spent;

pub use config::IssuerConfig;
pub use error::{IssuerError, Result};
pub use server::{app, routes, run, serve, IssuerState};
pub use signer::IssuerSigner;
pub use spent::SpentTokenStore;
