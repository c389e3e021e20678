mod app;
mod middleware;
mod state;

pub use app::create_app;
pub use middleware::{extract_credential, guard_middleware};
pub use state::AppState;
