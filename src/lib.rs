//! Sales Outreach — orchestration core for email and chat prospecting.

pub mod channels;
pub mod clients;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod store;
pub mod worker;
