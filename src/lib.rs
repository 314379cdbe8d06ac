pub mod config;
pub mod connector;
pub mod db;
pub mod error;
pub mod index;
pub mod model;
pub mod state;
pub mod sync;
pub mod transform;
