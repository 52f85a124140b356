//! PlantWatch client: the dashboard's data sync layer.
//!
//! Reads go through [`query::QueryClient`] on top of the shared cache store,
//! writes through [`mutation::MutationClient`], and the tenant every key is
//! scoped to comes from [`identity::ScopeState`].

pub mod api_client;
pub mod config;
pub mod confirmation;
pub mod credentials;
pub mod error;
pub mod events;
pub mod identity;
pub mod mutation;
pub mod notifications;
pub mod persistence;
pub mod poller;
pub mod query;
pub mod realtime;
pub mod resources;
pub mod telemetry;
