pub mod admin;
pub mod core;
pub mod hod;
pub mod staff;
