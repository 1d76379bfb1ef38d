pub mod archive;
pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod job;
pub mod markup;
pub mod scan;
pub mod status;
pub mod upload;
pub mod worker;
