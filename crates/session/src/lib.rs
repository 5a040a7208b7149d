//! Session credentials for the upstream account.
//!
//! This crate provides:
//! - An encrypted, owner-only credential file holding the session token
//! - The interactive login state machine and the bridge process that drives it

pub mod credentials;
pub mod error;
pub mod login;

pub use credentials::{CredentialStore, default_session_path};
pub use error::{CredentialError, CredentialResult, LoginError, LoginResult};
pub use login::{
    LoginAction, LoginDriver, LoginEvent, LoginHandle, LoginMachine, LoginState, classify_line,
    transition,
};
