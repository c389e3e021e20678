mod claims;
mod jwt;

pub use claims::{Claims, DEFAULT_TENANT_ID};
pub use jwt::JwtValidator;
