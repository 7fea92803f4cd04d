//! OAuth token lifecycle for the Zalo OA messaging platform.
//!
//! Produces a currently-valid access token on demand across three credential
//! provisioning modes (static access token, static access+refresh pair, and
//! store-backed with optional one-time code bootstrap), persisting refreshed
//! records through a pluggable [`TokenStore`].

mod manager;
mod oauth_client;
mod token_store;

pub use manager::{TokenError, TokenManager, TokenManagerConfig};
pub use oauth_client::{OauthClient, OauthTokenResponse};
pub use token_store::{FileTokenStore, TokenRecord, TokenStore};
