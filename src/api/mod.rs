pub mod routes;

pub use routes::endpoints;
pub use routes::scans;
pub use routes::schedules;
pub use routes::state::AppState;
