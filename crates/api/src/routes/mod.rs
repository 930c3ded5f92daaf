mod health;
mod sources;

pub use health::health_router;
pub use sources::api_router;
