pub mod attendance;
pub mod auth;
pub mod backup;
pub mod core;
pub mod feedback;
pub mod master;
pub mod points;
pub mod spin;
pub mod students;
