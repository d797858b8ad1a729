pub mod cache;
pub mod credential;

pub use cache::{CredentialCache, TokenIssuer};
pub use credential::AccessToken;
