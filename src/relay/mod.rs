mod status;

pub use status::{OrNull, StatusRelay, NULL_PLACEHOLDER};
