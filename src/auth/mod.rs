//! Session tokens, device tokens and the permission cache

pub mod gate;
pub mod permissions;
pub mod token;

pub use gate::{AuthGate, AUTH_TOKEN_HEADER, DEVICE_TOKEN_HEADER};
pub use permissions::{PermissionCache, PermissionMap};
pub use token::AuthClaims;
