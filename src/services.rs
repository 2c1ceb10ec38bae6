pub mod funnel_service;
pub mod funnel_validation;
