//! Feed pipeline services: fan-out, pagination and engagement hooks.

pub mod engagement;
pub mod error;
pub mod fanout;
pub mod jobs;
pub mod pagination;
pub mod repos;
pub mod retry;
pub mod timeline;
