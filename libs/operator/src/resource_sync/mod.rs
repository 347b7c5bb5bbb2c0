pub mod controller;
pub mod debounce;
pub mod engine;
pub mod record;
pub mod watch;
