//! Privacy-preserving ad confirmations and token redemption.
//!
//! Ad events become confirmations carrying a blinded token. The issuer signs the token
//! without seeing it and proves it used its published key; the unblinded result is pooled
//! and later spent in a payout that cannot be linked back to the event.
//!
//! ```rust,no_run
//! use ads_confirmations::{
//!     AdEvent, ConfirmationType, Confirmations, ConfirmationsConfig, CreativeAd, MemoryStore,
//!     Notifier, SystemClock, Transport,
//! };
//! use std::sync::Arc;
//!
//! async fn run(transport: Arc<dyn Transport>) -> ads_confirmations::Result<()> {
//!     let (notifier, mut events) = Notifier::channel();
//!     let service = Confirmations::load(
//!         ConfirmationsConfig::default(),
//!         Arc::new(MemoryStore::new()),
//!         transport,
//!         Arc::new(SystemClock),
//!         notifier,
//!     )
//!     .await?;
//!     let (handle, _task) = service.spawn();
//!
//!     let ad = CreativeAd::new("creative", "set", "campaign").with_per_day(3);
//!     let event = AdEvent::new(&ad, ConfirmationType::Viewed, chrono::Utc::now());
//!     handle.confirm(event, ad).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod ads;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod confirmation;
pub mod error;
pub mod events;
pub mod exclusion;
pub mod handle;
pub mod issuers;
pub mod payout;
pub mod queue;
pub mod redeemer;
pub mod service;
pub mod store;
pub mod tokens;
pub mod transactions;
pub mod transport;

pub use ads::{AdEvent, AdEventTally, ConfirmationType, CreativeAd};
pub use clock::{Clock, SystemClock};
pub use config::ConfirmationsConfig;
pub use confirmation::{Confirmation, ConfirmationBuilder, RandomTokenGenerator, TokenGenerator};
pub use error::{
    CapExceededError, ConfirmationsError, NetworkError, RedemptionError, Result, StoreError,
    TokenError,
};
pub use events::{Notifier, RedemptionEvent};
pub use handle::ConfirmationsHandle;
pub use issuers::{Issuer, Issuers};
pub use payout::{PaymentBatch, PaymentToken};
pub use queue::{QueueEntry, RedemptionQueue, RedemptionState};
pub use service::{Cancellation, Confirmations, ConfirmationsStatus};
pub use store::{ConfirmationStore, JsonFileStore, MemoryStore};
pub use transport::{IssuerRequest, IssuerResponse, Method, Transport};

#[cfg(any(test, feature = "test-utils"))]
pub use clock::ManualClock;
#[cfg(any(test, feature = "test-utils"))]
pub use transport::{MockFailure, MockIssuer};
