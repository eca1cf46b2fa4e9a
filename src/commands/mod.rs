// ABOUTME: Command implementations for the CLI
// ABOUTME: Exports sync, check, and discover commands

pub mod check;
pub mod discover;
pub mod sync;

pub use check::check;
pub use discover::discover;
pub use sync::sync;
