pub mod controller;
pub mod ingest;
pub mod repo;
pub mod schedule;
pub mod select;
