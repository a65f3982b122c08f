//! GA4GH WES gateway: accepts workflow runs over HTTP, stores them, and
//! forwards them to a downstream WES or TES service.

pub mod config;
pub mod dispatcher;
pub mod http;
pub mod reconciler;
pub mod service;
pub mod service_info;
pub mod submission;
