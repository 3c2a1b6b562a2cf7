// Route handlers, one file per API area
pub mod analyze;
pub mod auth;
pub mod brews;
pub mod coffees;
pub mod health;
pub mod preferences;
