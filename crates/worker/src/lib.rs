//! Orchestration of try-on jobs against a ComfyUI-style backend.
//!
//! A [`service::Service`] owns one event channel and one single-flight
//! [`queue::RequestQueue`]. Each queued [`job::JobRequest`] is run by the
//! [`runner::JobRunner`]: normalize the workflow template, upload and
//! bind its assets, submit, then wait for the prompt's outputs.

pub mod config;
pub mod error;
pub mod job;
pub mod queue;
pub mod runner;
pub mod service;
