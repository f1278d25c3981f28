pub mod broker;
pub mod cli;
pub mod config;
pub mod listener;
pub mod normalize;
pub mod notify;
pub mod pipeline;
pub mod record;
pub mod service;
pub mod storage;
pub mod web;
