pub mod auth;
pub mod avatar;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod routes;
pub mod tables;
