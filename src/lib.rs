//! Idempotent, content-addressed execution cache
//!
//! Every mutating operation on an [`Environment`] advances a hash chain and is
//! memoized under the resulting hash, so re-running a pipeline skips work that
//! already happened. [`Stage`] memoizes calls that span several environments
//! by replaying their hash transitions, and [`FunctionCache`] memoizes plain
//! functions. [`Engine`] wires all of them to persistent stores from a
//! [`StatechainConfig`].

pub mod chain;
pub mod config;
pub mod deferred;
pub mod digest;
pub mod engine;
pub mod environment;
pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod memo;
pub mod normalize;
pub mod registry;
pub mod rerun;
pub mod stage;
pub mod store;
pub mod transport;
pub mod xdg;

// Re-export commonly used types
pub use config::StatechainConfig;
pub use deferred::{Deferred, MaybeDeferred};
pub use engine::Engine;
pub use environment::{EnvIdentity, Environment, Provisioning};
pub use error::{Error, Result};
pub use memo::{FunctionCache, FunctionKey};
pub use normalize::{Arg, CallArgs, ContentPath, Normalizer};
pub use registry::Registry;
pub use stage::Stage;
pub use store::KvStore;
