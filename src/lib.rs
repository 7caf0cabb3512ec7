//! Local-first feature flag evaluation and event capture core.
//!
//! The [`client`] function builds a [`Client`](client::Client) that evaluates
//! feature flags against a locally-polled ruleset whenever possible, falling
//! back to a remote evaluation endpoint only when local evaluation is
//! unavailable or inconclusive, and ships captured events through a
//! non-blocking, batching queue.

pub mod capture;
pub mod client;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod event;
pub mod flags;
pub mod hash;
pub mod transport;

pub use client::{client, Client, FlagLookupOptions};
pub use config::{ClientOptions, ClientOptionsBuilder};
pub use error::Error;
pub use event::{Event, Group, Groups};
pub use flags::model::FlagValue;

#[cfg(test)]
mod test_setup {
    use ctor::ctor;

    #[ctor]
    fn load_dotenv() {
        dotenvy::dotenv().ok();
    }
}
