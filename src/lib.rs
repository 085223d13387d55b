pub mod auth;
pub mod bus;
pub mod commands;
pub mod config;
pub mod connection_log;
pub mod db;
pub mod models;
pub mod mqtt_service;
pub mod notify;
pub mod registry;
pub mod service_utils;
pub mod shortid;
pub mod topic;
pub mod webhook;
