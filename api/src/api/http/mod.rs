pub mod health;
pub mod routes;
pub mod socket;

pub use routes::beacon_routes;
