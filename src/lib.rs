// Playtime: timed child play sessions with server-authoritative countdowns.
//
// The `sessions` module owns the lifecycle state machine and the expiry
// sweeper; `broadcast` fans committed changes out to observers; `clock`
// lets observers render countdowns against the server's clock. `api` and
// `client` carry all of it over HTTP.

pub mod api;
pub mod billing;
pub mod broadcast;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod sessions;
pub mod store;
