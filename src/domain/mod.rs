pub mod canary;
pub mod drift;
pub mod error;
pub mod fleet;
pub mod gitops;
pub mod service;
pub mod types;
pub mod validator;
