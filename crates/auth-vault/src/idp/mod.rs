mod client;
mod types;

pub use client::{IdpClient, IdpClientConfig};
pub use types::{IdpErrorResponse, IntrospectionResponse, TokenResponse, UserInfoResponse};
