pub mod core;
pub mod documents;
pub mod reports;
pub mod scores;
pub mod setup;
pub mod templates;
