//! Declarative HTTP functional-test player.
//!
//! Call definitions are plain test data. Before a call is sent, the
//! placeholder references in its request are resolved against the
//! calls that ran before it ([`injector`]); after it returns, the
//! expected response is compared with the actual one, each expected
//! collection under the semantics its metadata record asks for
//! ([`verification`], [`comparator`]).

pub mod api_client;
pub mod comparator;
pub mod config;
pub mod context;
pub mod error;
pub mod identity;
pub mod injector;
pub mod model;
pub mod provision;
pub mod reference;
pub mod runner;
pub mod verification;

pub use comparator::{JsonComparator, StructuralComparator, Verification};
pub use config::*;
pub use context::{ContextId, ContextNode, ContextTree};
pub use error::*;
pub use identity::{IdentityProvider, StaticIdentityProvider};
pub use injector::DynamicValueInjector;
pub use model::*;
pub use reference::Reference;
pub use runner::*;
pub use verification::CollectionVerificationConfig;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
