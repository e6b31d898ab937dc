pub mod clock;
pub mod config;
pub mod controller;
pub mod db;
pub mod exec;
pub mod jobs;
pub mod worker;
